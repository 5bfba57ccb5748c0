// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Best-effort delivery of a single control message to the host, with
//! bounded retry and exponential backoff.
//!
//! The hypervisor message channel fails transiently when the host is short
//! on message buffers, so delivery retries up to a fixed ceiling. Callers in
//! contexts that cannot block request [`WaitMode::Spin`] and never sleep,
//! even for large backoff delays.

use crate::platform::MessagePort;
use crate::platform::Waiter;
use crate::protocol::ConnectionId;
use crate::protocol::HvStatus;
use crate::protocol::MessageHeader;
use crate::protocol::MessageType;
use std::time::Duration;
use thiserror::Error;
use zerocopy::FromBytes;

/// Retry ceiling for a single message.
const MAX_RETRIES: u32 = 100;
/// The backoff delay doubles after each of this many retries, then holds.
const DOUBLING_RETRIES: u32 = 22;
/// Delays above this are realized by sleeping when the caller permits it.
const SLEEP_THRESHOLD: Duration = Duration::from_micros(1000);

/// Whether the caller's execution context permits blocking.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitMode {
    /// Busy-wait only; the caller must not yield (interrupt context).
    Spin,
    /// Sleep for large delays, busy-wait for small ones.
    Sleep,
}

/// A terminal failure to deliver a control message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PostError {
    /// The host rejected the bootstrap connection ID on the initial
    /// handshake message: it does not support the requested ID scheme.
    /// Not retryable; the caller should fall back to an older protocol.
    #[error("host does not support the requested message connection ID scheme")]
    UnsupportedConnectionId,
    /// The hypervisor returned a status that retrying cannot fix.
    #[error("hypervisor rejected the message with status {status:#x}", status = (.0).0)]
    Hypervisor(HvStatus),
    /// Every attempt failed with a transient status; the host is out of
    /// resources or unreachable.
    #[error("message retries exhausted, last status {status:#x}", status = (.0).0)]
    RetriesExhausted(HvStatus),
}

impl PostError {
    /// True when the failure indicates the host may be unreachable, so no
    /// further handshake attempts should be made.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PostError::RetriesExhausted(_))
    }
}

/// The delay before the attempt following `retry` failed attempts: 1us,
/// doubling for the first [`DOUBLING_RETRIES`] retries, constant after.
fn backoff_delay(retry: u32) -> Duration {
    Duration::from_micros(1 << retry.min(DOUBLING_RETRIES))
}

/// Posts `message` on `connection_id`, retrying transient failures.
///
/// Returns as soon as the hypervisor accepts the message or reports a
/// non-transient status.
pub fn post_message(
    port: &dyn MessagePort,
    waiter: &dyn Waiter,
    connection_id: ConnectionId,
    message: &[u8],
    mode: WaitMode,
) -> Result<(), PostError> {
    let message_type = MessageHeader::read_from_prefix(message)
        .map(|(header, _)| header.message_type)
        .unwrap_or(MessageType(0));

    let mut last = HvStatus::SUCCESS;
    for retry in 0..MAX_RETRIES {
        let status = port.post_message(connection_id, message);
        match status {
            HvStatus::SUCCESS => return Ok(()),
            HvStatus::INVALID_CONNECTION_ID => {
                // On the initial handshake this means the host predates the
                // bootstrap connection ID and will never accept it. On any
                // other message it can occur transiently when messages are
                // sent too frequently.
                if message_type == MessageType::INITIATE_CONTACT {
                    return Err(PostError::UnsupportedConnectionId);
                }
                last = status;
            }
            HvStatus::INSUFFICIENT_MEMORY | HvStatus::INSUFFICIENT_BUFFERS => {
                last = status;
            }
            other => return Err(PostError::Hypervisor(other)),
        }

        let delay = backoff_delay(retry);
        if mode == WaitMode::Sleep && delay > SLEEP_THRESHOLD {
            waiter.sleep(delay);
        } else {
            waiter.busy_wait(delay);
        }
    }
    Err(PostError::RetriesExhausted(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    /// Returns a scripted sequence of statuses, then the last one forever.
    struct ScriptedPort {
        script: Mutex<Vec<HvStatus>>,
        attempts: AtomicUsize,
    }

    impl ScriptedPort {
        fn new(mut script: Vec<HvStatus>) -> Self {
            script.reverse();
            ScriptedPort {
                script: Mutex::new(script),
                attempts: AtomicUsize::new(0),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::Relaxed)
        }
    }

    impl MessagePort for ScriptedPort {
        fn post_message(&self, _connection_id: ConnectionId, _message: &[u8]) -> HvStatus {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop().unwrap()
            } else {
                *script.last().unwrap()
            }
        }
    }

    /// Records every delay instead of waiting it out.
    #[derive(Default)]
    struct RecordingWaiter {
        spins: Mutex<Vec<Duration>>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl Waiter for RecordingWaiter {
        fn busy_wait(&self, duration: Duration) {
            self.spins.lock().push(duration);
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
        }
    }

    fn initiate_contact() -> Vec<u8> {
        crate::protocol::OutgoingMessage::new(&crate::protocol::InitiateContact {
            version_requested: 0,
            target_message_vp: 0,
            interrupt_page_or_target_info: 0,
            parent_to_child_monitor_page_gpa: 0,
            child_to_parent_monitor_page_gpa: 0,
        })
        .data()
        .to_vec()
    }

    fn other_message() -> Vec<u8> {
        crate::protocol::OutgoingMessage::new(&crate::protocol::Unload {})
            .data()
            .to_vec()
    }

    #[test]
    fn success_first_attempt() {
        let port = ScriptedPort::new(vec![HvStatus::SUCCESS]);
        let waiter = RecordingWaiter::default();
        post_message(
            &port,
            &waiter,
            ConnectionId::LEGACY_MESSAGE,
            &other_message(),
            WaitMode::Sleep,
        )
        .unwrap();
        assert_eq!(port.attempts(), 1);
        assert!(waiter.spins.lock().is_empty());
        assert!(waiter.sleeps.lock().is_empty());
    }

    #[test]
    fn invalid_connection_id_on_initiate_contact_fails_without_retry() {
        let port = ScriptedPort::new(vec![HvStatus::INVALID_CONNECTION_ID]);
        let waiter = RecordingWaiter::default();
        let err = post_message(
            &port,
            &waiter,
            ConnectionId::BOOTSTRAP_MESSAGE,
            &initiate_contact(),
            WaitMode::Sleep,
        )
        .unwrap_err();
        assert_eq!(err, PostError::UnsupportedConnectionId);
        assert_eq!(port.attempts(), 1);
    }

    #[test]
    fn invalid_connection_id_elsewhere_is_transient() {
        let port = ScriptedPort::new(vec![HvStatus::INVALID_CONNECTION_ID, HvStatus::SUCCESS]);
        let waiter = RecordingWaiter::default();
        post_message(
            &port,
            &waiter,
            ConnectionId::LEGACY_MESSAGE,
            &other_message(),
            WaitMode::Sleep,
        )
        .unwrap();
        assert_eq!(port.attempts(), 2);
    }

    #[test]
    fn fatal_status_not_retried() {
        let port = ScriptedPort::new(vec![HvStatus::INVALID_HYPERCALL_CODE]);
        let waiter = RecordingWaiter::default();
        let err = post_message(
            &port,
            &waiter,
            ConnectionId::LEGACY_MESSAGE,
            &other_message(),
            WaitMode::Sleep,
        )
        .unwrap_err();
        assert_eq!(err, PostError::Hypervisor(HvStatus::INVALID_HYPERCALL_CODE));
        assert_eq!(port.attempts(), 1);
    }

    #[test]
    fn transient_status_retries_to_ceiling_with_doubling_backoff() {
        let port = ScriptedPort::new(vec![HvStatus::INSUFFICIENT_BUFFERS]);
        let waiter = RecordingWaiter::default();
        let err = post_message(
            &port,
            &waiter,
            ConnectionId::LEGACY_MESSAGE,
            &other_message(),
            WaitMode::Sleep,
        )
        .unwrap_err();
        assert_eq!(err, PostError::RetriesExhausted(HvStatus::INSUFFICIENT_BUFFERS));
        assert_eq!(port.attempts(), 100);

        // All delays in order, regardless of how they were realized.
        let mut delays: Vec<Duration> = (0..100).map(backoff_delay).collect();
        assert_eq!(delays.len(), 100);
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        for (i, pair) in delays.windows(2).enumerate() {
            if (i as u32) < DOUBLING_RETRIES {
                assert_eq!(pair[1], pair[0] * 2);
            } else {
                assert_eq!(pair[1], pair[0]);
            }
        }

        // Small delays spin, large delays sleep.
        let spins = waiter.spins.lock();
        let sleeps = waiter.sleeps.lock();
        assert_eq!(spins.len() + sleeps.len(), 100);
        assert!(spins.iter().all(|&d| d <= SLEEP_THRESHOLD));
        assert!(sleeps.iter().all(|&d| d > SLEEP_THRESHOLD));
        delays.truncate(spins.len());
        assert_eq!(&*spins, &delays);
    }

    #[test]
    fn errors_render_status_as_hex() {
        assert_eq!(
            PostError::Hypervisor(HvStatus::TIMEOUT).to_string(),
            "hypervisor rejected the message with status 0x78"
        );
        assert_eq!(
            PostError::RetriesExhausted(HvStatus::INSUFFICIENT_BUFFERS).to_string(),
            "message retries exhausted, last status 0x13"
        );
    }

    #[test]
    fn spin_mode_never_sleeps() {
        let port = ScriptedPort::new(vec![HvStatus::INSUFFICIENT_MEMORY]);
        let waiter = RecordingWaiter::default();
        let err = post_message(
            &port,
            &waiter,
            ConnectionId::LEGACY_MESSAGE,
            &other_message(),
            WaitMode::Spin,
        )
        .unwrap_err();
        assert_eq!(err, PostError::RetriesExhausted(HvStatus::INSUFFICIENT_MEMORY));
        assert!(waiter.sleeps.lock().is_empty());
        assert_eq!(waiter.spins.lock().len(), 100);
    }
}
