// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The channel registry and interrupt-time event dispatch.
//!
//! The table maps host-assigned relative IDs to channel objects. Insertion
//! and removal belong to the offer/rescind machinery; this module only
//! guarantees that lookups from event-delivery context are lock-free and
//! tolerate concurrent removal.

use arc_swap::ArcSwapOption;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Capacity of the channel table: one relative ID per interrupt bit in half
/// a shared page.
pub const MAX_CHANNEL_RELIDS: usize = (crate::platform::PAGE_SIZE / 2) * 8;

/// How the host signals the channel and how reads are paced.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CallbackMode {
    /// The callback runs once per signal.
    #[default]
    Direct,
    /// The callback drains the ring; delivery is re-armed until the ring
    /// reports empty.
    Batched,
}

/// The inbound ring-buffer contract consumed by batched event dispatch.
pub trait InboundRing: Send + Sync {
    /// Masks further host interrupts while the guest reads.
    fn begin_read(&self);
    /// Unmasks interrupts; returns the bytes that arrived in the meantime.
    fn end_read(&self) -> u32;
}

/// The callback registered by a channel's owner, capturing its context.
pub type ChannelCallback = Box<dyn Fn() + Send + Sync>;

/// A communication channel as seen by the connection control plane.
///
/// Owned by the offer subsystem; this module reads its callback, delivery
/// mode, and host-facing identifiers.
pub struct Channel {
    relid: u32,
    mode: CallbackMode,
    dedicated_interrupt: bool,
    /// The host-facing token passed to the signal-event hypercall.
    sig_event: u64,
    /// Diagnostic count of outbound signals.
    sig_events: AtomicU64,
    inbound: Option<Arc<dyn InboundRing>>,
    callback: ArcSwapOption<ChannelCallback>,
}

impl Channel {
    pub fn new(
        relid: u32,
        mode: CallbackMode,
        dedicated_interrupt: bool,
        sig_event: u64,
        inbound: Option<Arc<dyn InboundRing>>,
    ) -> Self {
        Channel {
            relid,
            mode,
            dedicated_interrupt,
            sig_event,
            sig_events: AtomicU64::new(0),
            inbound,
            callback: ArcSwapOption::empty(),
        }
    }

    pub fn relid(&self) -> u32 {
        self.relid
    }

    pub fn mode(&self) -> CallbackMode {
        self.mode
    }

    pub fn has_dedicated_interrupt(&self) -> bool {
        self.dedicated_interrupt
    }

    pub fn sig_event(&self) -> u64 {
        self.sig_event
    }

    /// The number of signals sent on this channel.
    pub fn signal_count(&self) -> u64 {
        self.sig_events.load(Ordering::Relaxed)
    }

    pub(crate) fn count_signal(&self) {
        self.sig_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Registers the owner's event callback.
    pub fn set_callback(&self, callback: ChannelCallback) {
        self.callback.store(Some(Arc::new(callback)));
    }

    /// Clears the callback. An unloading owner does this before tearing
    /// down; in-flight dispatches then become no-ops.
    pub fn clear_callback(&self) {
        self.callback.store(None);
    }
}

/// The outcome of one event-dispatch pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// No further work pending.
    Complete,
    /// The inbound ring still has data; the caller must schedule another
    /// pass. Fairness between passes is the scheduler's concern, not ours.
    Reschedule,
}

/// Processes one event notification for `channel`.
///
/// Runs in latency-sensitive delivery context and never blocks. A missing
/// callback means the owner unregistered concurrently; that is a legitimate
/// race and dispatch quietly completes.
pub fn on_event(channel: &Channel) -> DispatchResult {
    let Some(callback) = channel.callback.load_full() else {
        return DispatchResult::Complete;
    };
    (*callback)();

    if channel.mode != CallbackMode::Batched {
        return DispatchResult::Complete;
    }
    let Some(ring) = &channel.inbound else {
        return DispatchResult::Complete;
    };
    if ring.end_read() == 0 {
        return DispatchResult::Complete;
    }
    ring.begin_read();
    DispatchResult::Reschedule
}

/// Fixed-capacity registry of channels, indexed by relative ID.
///
/// Each slot is an atomic reference cell: the offer subsystem stores with
/// release ordering, lookups load with acquire ordering, so a reader either
/// sees a fully constructed channel or nothing.
pub struct ChannelTable {
    slots: Box<[ArcSwapOption<Channel>]>,
}

impl ChannelTable {
    /// Creates a table with all [`MAX_CHANNEL_RELIDS`] slots empty.
    pub fn new() -> Self {
        ChannelTable {
            slots: (0..MAX_CHANNEL_RELIDS)
                .map(|_| ArcSwapOption::empty())
                .collect(),
        }
    }

    /// Returns the channel registered at `relid`, if any. Lock-free; out of
    /// range IDs return `None` with no side effects.
    pub fn lookup(&self, relid: u32) -> Option<Arc<Channel>> {
        self.slots.get(relid as usize)?.load_full()
    }

    /// Registers `channel` at its relative ID. Offer-subsystem use only.
    pub fn bind(&self, channel: Arc<Channel>) {
        let relid = channel.relid as usize;
        assert!(relid < MAX_CHANNEL_RELIDS);
        self.slots[relid].store(Some(channel));
    }

    /// Removes the channel at `relid`, returning it if present.
    pub fn unbind(&self, relid: u32) -> Option<Arc<Channel>> {
        self.slots.get(relid as usize)?.swap(None)
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}
