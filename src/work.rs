// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Background work queues for processing host messages and channel offers
//! off the event-delivery path.

use crossbeam_channel::Sender;
use std::thread::JoinHandle;
use thiserror::Error;

type Work = Box<dyn FnOnce() + Send>;

/// Work could not be queued because the queue has shut down.
#[derive(Debug, Error)]
#[error("work queue is shut down")]
pub struct QueueClosed;

/// A named single-threaded work queue. Submitted items run in order on a
/// dedicated thread; [`WorkQueue::shutdown`] drains outstanding work before
/// returning.
pub struct WorkQueue {
    send: Option<Sender<Work>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawns the worker thread. Fails if the OS refuses the thread, which
    /// the connection treats like any other allocation failure.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (send, recv) = crossbeam_channel::unbounded::<Work>();
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for work in recv {
                    work();
                }
            })?;
        Ok(WorkQueue {
            send: Some(send),
            thread: Some(thread),
        })
    }

    /// Queues `work` to run on the worker thread.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, work: F) -> Result<(), QueueClosed> {
        self.send
            .as_ref()
            .ok_or(QueueClosed)?
            .send(Box::new(work))
            .map_err(|_| QueueClosed)
    }

    /// Stops accepting work, runs everything already queued, and joins the
    /// worker thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the sender ends the worker's receive loop after it
        // drains the queue.
        drop(self.send.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("work queue thread panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
