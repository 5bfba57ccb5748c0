// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The connection lifecycle orchestrator: owns the shared signaling pages,
//! the background work queues, and the channel table, and drives version
//! negotiation with the host.


use crate::channels::Channel;
use crate::channels::ChannelTable;
use crate::platform::AllocError;
use crate::platform::GuestPage;
use crate::platform::Platform;
use crate::platform::VisibilityError;
use crate::protocol::ConnectionId;
use crate::protocol::InitiateContact;
use crate::protocol::MessageType;
use crate::protocol::OutgoingMessage;
use crate::protocol::TargetInfo;
use crate::protocol::Unload;
use crate::protocol::Version;
use crate::protocol::VersionResponse;
use crate::protocol::SINT;
use crate::transport;
use crate::transport::PostError;
use crate::transport::WaitMode;
use crate::work::QueueClosed;
use crate::work::WorkQueue;
use arc_swap::ArcSwapOption;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// The connection lifecycle state.
///
/// Transitions are monotonic within one connect attempt and are made only by
/// the orchestrating thread; everything else just reads the current value.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new() -> Self {
        PhaseCell(AtomicU8::new(ConnectionPhase::Disconnected as u8))
    }

    fn load(&self) -> ConnectionPhase {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionPhase::Disconnected,
            1 => ConnectionPhase::Connecting,
            _ => ConnectionPhase::Connected,
        }
    }

    fn store(&self, phase: ConnectionPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    /// Disconnected -> Connecting, failing if a connection is already active.
    fn try_begin_connect(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionPhase::Disconnected as u8,
                ConnectionPhase::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A one-shot completion signal carrying the host's response.
struct Completion<T> {
    state: Mutex<Option<T>>,
    condvar: Condvar,
}

impl<T: Copy> Completion<T> {
    fn new() -> Self {
        Completion {
            state: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    fn complete(&self, value: T) {
        *self.state.lock() = Some(value);
        self.condvar.notify_all();
    }

    fn is_complete(&self) -> bool {
        self.state.lock().is_some()
    }

    fn wait(&self) -> T {
        let mut state = self.state.lock();
        while state.is_none() {
            self.condvar.wait(&mut state);
        }
        state.unwrap()
    }
}

/// An in-flight handshake message awaiting the host's response.
///
/// Owned by the negotiating caller; registered in the pending list only for
/// the duration of the wait.
struct PendingRequest {
    message: OutgoingMessage,
    response: Completion<VersionResponse>,
}

impl PendingRequest {
    fn new(message: OutgoingMessage) -> Self {
        PendingRequest {
            message,
            response: Completion::new(),
        }
    }
}

/// The shared pages published to the host during the handshake.
///
/// Fields are populated as allocation proceeds so a failed connect can
/// release exactly what exists.
#[derive(Default)]
struct ConnectionPages {
    /// Split page: receive interrupt bits in the first half, send interrupt
    /// bits in the second.
    interrupt: Option<GuestPage>,
    /// Monitor pages: parent-to-child, then child-to-parent.
    monitor: [Option<GuestPage>; 2],
}

struct WorkQueues {
    control: WorkQueue,
    rescind: WorkQueue,
    primary_offers: WorkQueue,
    sub_offers: WorkQueue,
}

impl WorkQueues {
    fn new() -> std::io::Result<Self> {
        Ok(WorkQueues {
            control: WorkQueue::new("vmbus-con")?,
            rescind: WorkQueue::new("vmbus-rescind")?,
            primary_offers: WorkQueue::new("vmbus-pri-chan")?,
            sub_offers: WorkQueue::new("vmbus-sub-chan")?,
        })
    }
}

/// A fatal connection failure. Any of these leaves the connection fully
/// disconnected with its resources released.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("a connection is already active")]
    InvalidPhase,
    #[error("failed to create connection work queues")]
    WorkQueue(#[source] std::io::Error),
    #[error("failed to allocate shared pages")]
    PageAlloc(#[from] AllocError),
    #[error("failed to make monitor pages host-visible")]
    PageVisibility(#[from] VisibilityError),
    #[error("no protocol version was accepted by the host")]
    NoCompatibleVersion,
    #[error("host version {version} is below the minimum {required} required for isolation")]
    IncompatibleHostVersion { version: Version, required: Version },
    #[error("handshake transport failure")]
    Transport(#[source] PostError),
}

/// Outcome of a single version negotiation attempt.
enum NegotiateError {
    /// The host does not support this version; try the next one down.
    Refused,
    /// The handshake message could not be delivered.
    Send(PostError),
}

/// The guest end of the VMBus connection to the host.
///
/// A single instance owns all connection-wide state; there is no ambient
/// global. Lifecycle: [`VmbusConnection::builder`] → [`connect`] →
/// [`disconnect`] → drop.
///
/// [`connect`]: VmbusConnection::connect
/// [`disconnect`]: VmbusConnection::disconnect
pub struct VmbusConnection {
    pub(crate) platform: Platform,
    max_version: Option<Version>,
    phase: PhaseCell,
    /// Negotiated version as its wire value; zero until negotiated.
    version: AtomicU32,
    /// The message connection ID for all outbound control messages.
    msg_conn_id: AtomicU32,
    /// Handshake messages awaiting a response. The lock is held only around
    /// insertion and removal, never across the response wait.
    pending: Mutex<Vec<Arc<PendingRequest>>>,
    pages: Mutex<ConnectionPages>,
    /// Lock-free view of the interrupt page for the event signaler.
    pub(crate) interrupt_page: ArcSwapOption<GuestPage>,
    channels: ArcSwapOption<ChannelTable>,
    queues: Mutex<Option<WorkQueues>>,
}

/// Configures and creates a [`VmbusConnection`].
pub struct VmbusConnectionBuilder {
    platform: Platform,
    max_version: Option<Version>,
}

impl VmbusConnectionBuilder {
    /// Caps negotiation at `version`, for testing and debugging against
    /// older host behavior.
    pub fn max_version(mut self, version: Version) -> Self {
        self.max_version = Some(version);
        self
    }

    pub fn build(self) -> VmbusConnection {
        VmbusConnection {
            platform: self.platform,
            max_version: self.max_version,
            phase: PhaseCell::new(),
            version: AtomicU32::new(0),
            msg_conn_id: AtomicU32::new(ConnectionId::LEGACY_MESSAGE.into()),
            pending: Mutex::new(Vec::new()),
            pages: Mutex::new(ConnectionPages::default()),
            interrupt_page: ArcSwapOption::empty(),
            channels: ArcSwapOption::empty(),
            queues: Mutex::new(None),
        }
    }
}

impl VmbusConnection {
    pub fn builder(platform: Platform) -> VmbusConnectionBuilder {
        VmbusConnectionBuilder {
            platform,
            max_version: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase.load()
    }

    /// The negotiated protocol version, once connected.
    pub fn version(&self) -> Option<Version> {
        Version::from_wire(self.version.load(Ordering::Acquire))
    }

    /// Establishes the connection: allocates shared resources and negotiates
    /// a protocol version, newest to oldest.
    ///
    /// On failure everything is rolled back through [`Self::disconnect`].
    pub fn connect(&self) -> Result<Version, ConnectError> {
        if !self.phase.try_begin_connect() {
            return Err(ConnectError::InvalidPhase);
        }
        match self.connect_inner() {
            Ok(version) => {
                tracing::info!(%version, "vmbus connected");
                Ok(version)
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "unable to connect to host"
                );
                self.disconnect();
                Err(err)
            }
        }
    }

    fn connect_inner(&self) -> Result<Version, ConnectError> {
        *self.queues.lock() = Some(WorkQueues::new().map_err(ConnectError::WorkQueue)?);

        let pool = self.platform.pages.clone();
        {
            let mut pages = self.pages.lock();
            pages.interrupt = Some(pool.alloc_page()?);

            let monitor = [pool.alloc_page()?, pool.alloc_page()?];
            if let Err(err) = monitor
                .iter()
                .try_for_each(|page| pool.make_shared(page))
            {
                // The visibility state of the pages is now unknown. Leak
                // them rather than returning possibly-decrypted memory to
                // the pool. Both are handled the same for simplicity.
                tracing::warn!(
                    gpa0 = monitor[0].gpa(),
                    gpa1 = monitor[1].gpa(),
                    "leaking monitor pages with unknown visibility state"
                );
                return Err(err.into());
            }
            // Changing visibility can scramble contents, so zero after.
            for page in &monitor {
                page.zero();
            }
            let [m0, m1] = monitor;
            pages.monitor = [Some(m0), Some(m1)];
            self.interrupt_page
                .store(pages.interrupt.clone().map(Arc::new));
        }

        self.channels.store(Some(Arc::new(ChannelTable::new())));

        let mut accepted = None;
        for &version in Version::DESCENDING {
            if self.max_version.is_some_and(|max| version > max) {
                continue;
            }
            match self.negotiate_version(version) {
                Ok(()) => {
                    accepted = Some(version);
                    break;
                }
                Err(NegotiateError::Refused) => {}
                // An old host rejects the bootstrap connection ID outright;
                // older protocol versions use the legacy ID and may still
                // succeed.
                Err(NegotiateError::Send(PostError::UnsupportedConnectionId)) => {}
                // A delivery timeout means the host may be unreachable;
                // trying older versions would just stall again.
                Err(NegotiateError::Send(err)) => return Err(ConnectError::Transport(err)),
            }
        }
        let version = accepted.ok_or(ConnectError::NoCompatibleVersion)?;

        if self.platform.caps.isolation.is_isolated() && version < Version::ISOLATION_MINIMUM {
            return Err(ConnectError::IncompatibleHostVersion {
                version,
                required: Version::ISOLATION_MINIMUM,
            });
        }

        self.version.store(version as u32, Ordering::Release);
        Ok(version)
    }

    /// Attempts the handshake at `version`, blocking for the host response.
    ///
    /// On acceptance the phase moves to Connected and, for versions with
    /// multiplexed connection IDs, the host-chosen message connection ID is
    /// adopted for all subsequent traffic.
    fn negotiate_version(&self, version: Version) -> Result<(), NegotiateError> {
        let caps = &self.platform.caps;
        let (interrupt_gpa, monitor_gpas) = {
            let pages = self.pages.lock();
            (
                pages.interrupt.as_ref().map_or(0, |p| p.gpa()),
                pages
                    .monitor
                    .each_ref()
                    .map(|p| p.as_ref().map_or(0, |p| p.gpa())),
            )
        };

        let interrupt_page_or_target_info;
        if version >= Version::MULTIPLEXED_CONNECTION_IDS {
            // The handshake goes out on the fixed bootstrap ID; the host
            // returns the real ID in its response. The interrupt page is no
            // longer advertised, but the SINT still is, for compatibility.
            interrupt_page_or_target_info =
                TargetInfo::new().with_sint(SINT).with_vtl(caps.vtl).into();
            self.msg_conn_id
                .store(ConnectionId::BOOTSTRAP_MESSAGE.into(), Ordering::Release);
        } else {
            interrupt_page_or_target_info = interrupt_gpa;
            self.msg_conn_id
                .store(ConnectionId::LEGACY_MESSAGE.into(), Ordering::Release);
        }

        // The boundary is zero on non-isolated partitions, so it is safe to
        // OR unconditionally.
        let message = OutgoingMessage::new(&InitiateContact {
            version_requested: version as u32,
            target_message_vp: caps.connect_vp,
            interrupt_page_or_target_info,
            parent_to_child_monitor_page_gpa: monitor_gpas[0] | caps.shared_gpa_boundary,
            child_to_parent_monitor_page_gpa: monitor_gpas[1] | caps.shared_gpa_boundary,
        });

        // Register before sending; the response may arrive before the send
        // call returns.
        let request = Arc::new(PendingRequest::new(message));
        self.pending.lock().push(request.clone());

        let sent = self.post_message(message.data(), WaitMode::Sleep);
        if let Err(err) = sent {
            self.remove_pending(&request);
            return Err(NegotiateError::Send(err));
        }

        let response = request.response.wait();
        self.remove_pending(&request);

        if response.version_supported == 0 {
            return Err(NegotiateError::Refused);
        }
        self.phase.store(ConnectionPhase::Connected);
        if version >= Version::MULTIPLEXED_CONNECTION_IDS {
            self.msg_conn_id
                .store(response.connection_id, Ordering::Release);
        }
        Ok(())
    }

    fn remove_pending(&self, request: &Arc<PendingRequest>) {
        self.pending
            .lock()
            .retain(|entry| !Arc::ptr_eq(entry, request));
    }

    /// Delivers the host's version response to the outstanding handshake.
    ///
    /// Called from the control-message processing path. A response with no
    /// matching request is ignored; the host is free to send stale replies.
    pub fn on_version_response(&self, response: VersionResponse) {
        let pending = self.pending.lock();
        if let Some(request) = pending.iter().find(|request| {
            request.message.message_type() == MessageType::INITIATE_CONTACT
                && !request.response.is_complete()
        }) {
            request.response.complete(response);
        } else {
            tracing::debug!("version response with no pending handshake");
        }
    }

    /// Posts a control message to the host on the current message
    /// connection ID.
    pub fn post_message(&self, message: &[u8], mode: WaitMode) -> Result<(), PostError> {
        transport::post_message(
            self.platform.message_port.as_ref(),
            self.platform.waiter.as_ref(),
            ConnectionId::from(self.msg_conn_id.load(Ordering::Acquire)),
            message,
            mode,
        )
    }

    /// Returns the channel registered for `relid`.
    ///
    /// `None` for out-of-range IDs, for empty slots, and when the table was
    /// never allocated because no connect ran.
    pub fn relid_to_channel(&self, relid: u32) -> Option<Arc<Channel>> {
        self.channels.load_full()?.lookup(relid)
    }

    /// The channel table, for the offer subsystem to bind and unbind
    /// channels. `None` unless a connect has run.
    pub fn channel_table(&self) -> Option<Arc<ChannelTable>> {
        self.channels.load_full()
    }

    /// Queues control-message processing work.
    pub fn queue_control_work<F: FnOnce() + Send + 'static>(&self, work: F) -> Result<(), QueueClosed> {
        self.submit(|q| &q.control, work)
    }

    /// Queues rescind processing work.
    pub fn queue_rescind_work<F: FnOnce() + Send + 'static>(&self, work: F) -> Result<(), QueueClosed> {
        self.submit(|q| &q.rescind, work)
    }

    /// Queues primary-channel offer work.
    pub fn queue_primary_offer_work<F: FnOnce() + Send + 'static>(
        &self,
        work: F,
    ) -> Result<(), QueueClosed> {
        self.submit(|q| &q.primary_offers, work)
    }

    /// Queues sub-channel offer work.
    pub fn queue_sub_offer_work<F: FnOnce() + Send + 'static>(
        &self,
        work: F,
    ) -> Result<(), QueueClosed> {
        self.submit(|q| &q.sub_offers, work)
    }

    fn submit<F: FnOnce() + Send + 'static>(
        &self,
        queue: impl FnOnce(&WorkQueues) -> &WorkQueue,
        work: F,
    ) -> Result<(), QueueClosed> {
        let queues = self.queues.lock();
        queue(queues.as_ref().ok_or(QueueClosed)?).submit(work)
    }

    /// Tears the connection down. Idempotent and safe from any phase,
    /// including a partially initialized one.
    pub fn disconnect(&self) {
        // Best effort; cleanup proceeds regardless of the outcome.
        if self.phase.load() == ConnectionPhase::Connected {
            let unload = OutgoingMessage::new(&Unload {});
            if let Err(err) = self.post_message(unload.data(), WaitMode::Sleep) {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "unload message not delivered"
                );
            }
        }

        // Take the queues out before joining the workers so a work item
        // submitting follow-up work can still acquire the lock (and get
        // QueueClosed) instead of deadlocking against the join.
        let queues = self.queues.lock().take();
        if let Some(queues) = queues {
            queues.control.shutdown();
            queues.rescind.shutdown();
            queues.primary_offers.shutdown();
            queues.sub_offers.shutdown();
        }

        self.channels.store(None);
        self.interrupt_page.store(None);

        let pool = &self.platform.pages;
        let mut pages = self.pages.lock();
        if let Some(page) = pages.interrupt.take() {
            pool.free_page(page);
        }
        for slot in &mut pages.monitor {
            if let Some(page) = slot.take() {
                match pool.make_private(&page) {
                    Ok(()) => pool.free_page(page),
                    Err(_) => {
                        // Encryption state unknown; never hand the page back
                        // to a general allocator.
                        tracing::warn!(
                            gpa = page.gpa(),
                            "leaking monitor page that could not be made private"
                        );
                    }
                }
            }
        }
        drop(pages);

        self.version.store(0, Ordering::Release);
        self.msg_conn_id
            .store(ConnectionId::LEGACY_MESSAGE.into(), Ordering::Release);
        self.phase.store(ConnectionPhase::Disconnected);
    }
}

impl Drop for VmbusConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
