// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seams between the connection control plane and the platform: the
//! hypervisor message and hypercall channels, guest page allocation, and the
//! partition capabilities queried once at startup.

use crate::protocol::ConnectionId;
use crate::protocol::HvStatus;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Size of a guest page shared with the host.
pub const PAGE_SIZE: usize = 4096;
/// A page as 64-bit words, the granularity of interrupt bit updates.
pub const PAGE_WORDS: usize = PAGE_SIZE / 8;

/// The hypervisor message channel: posts one control message to the host.
pub trait MessagePort: Send + Sync {
    /// Posts `message` on `connection_id`, returning the hypervisor status.
    fn post_message(&self, connection_id: ConnectionId, message: &[u8]) -> HvStatus;
}

/// The hypervisor notification channels: opaque one-way calls keyed by a
/// control word and a 64-bit input.
pub trait HypercallPort: Send + Sync {
    /// Issues a fast hypercall with a single register input.
    fn fast_hypercall8(&self, control: u64, input: u64);
    /// Issues a hypercall through the GHCB protocol (SNP partitions).
    fn ghcb_hypercall(&self, control: u64, input: u64);
    /// Issues a hypercall through the TDX module (TDX partitions).
    fn tdx_hypercall(&self, control: u64, input: u64);
}

/// Failure to allocate a guest page.
#[derive(Debug, Error)]
#[error("guest page allocation failed")]
pub struct AllocError;

/// Failure to change the host visibility of a guest page.
#[derive(Debug, Error)]
#[error("failed to change page visibility")]
pub struct VisibilityError;

/// Allocates pages whose guest physical addresses can be published to the
/// host, and switches their visibility on isolated partitions.
///
/// `make_shared`/`make_private` are no-ops on partitions without memory
/// isolation and must still return success there.
pub trait PagePool: Send + Sync {
    /// Allocates a zeroed page.
    fn alloc_page(&self) -> Result<GuestPage, AllocError>;
    /// Makes a page visible to the host (decrypted).
    fn make_shared(&self, page: &GuestPage) -> Result<(), VisibilityError>;
    /// Returns a page to guest-private (encrypted) state.
    fn make_private(&self, page: &GuestPage) -> Result<(), VisibilityError>;
    /// Returns a page to the pool. The page must be in the private state.
    fn free_page(&self, page: GuestPage);
}

/// A handle to an allocated guest page: its guest physical address and a
/// shared view of its contents.
///
/// Clones alias the same page.
#[derive(Debug, Clone)]
pub struct GuestPage {
    gpa: u64,
    words: Arc<[AtomicU64]>,
}

impl GuestPage {
    /// Creates a zeroed page at `gpa`. Called by [`PagePool`] implementations.
    pub fn new(gpa: u64) -> Self {
        GuestPage {
            gpa,
            words: (0..PAGE_WORDS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// The page's guest physical address.
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    /// Zeroes the page contents.
    pub fn zero(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Atomically sets bit `index` within the page, with release ordering so
    /// the host observes prior ring writes first.
    pub fn set_bit(&self, index: usize) {
        assert!(index < PAGE_SIZE * 8);
        self.words[index / 64].fetch_or(1 << (index % 64), Ordering::Release);
    }

    /// Reads bit `index` within the page.
    pub fn bit(&self, index: usize) -> bool {
        assert!(index < PAGE_SIZE * 8);
        self.words[index / 64].load(Ordering::Acquire) & (1 << (index % 64)) != 0
    }
}

/// How the transport realizes a retry delay. Chosen by the caller's execution
/// context: interrupt-adjacent callers must spin, task context may sleep.
pub trait Waiter: Send + Sync {
    /// Delays without yielding the processor.
    fn busy_wait(&self, duration: Duration);
    /// Delays by yielding, potentially sleeping.
    fn sleep(&self, duration: Duration);
}

/// [`Waiter`] backed by the OS scheduler.
pub struct StdWaiter;

impl Waiter for StdWaiter {
    fn busy_wait(&self, duration: Duration) {
        let deadline = std::time::Instant::now() + duration;
        while std::time::Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// The memory isolation technology the partition runs under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum IsolationType {
    #[default]
    None,
    Snp,
    Tdx,
}

impl IsolationType {
    pub fn is_isolated(&self) -> bool {
        !matches!(self, IsolationType::None)
    }
}

/// Partition capabilities, queried from the platform once and cached for the
/// connection's lifetime.
#[derive(Debug, Copy, Clone, Default)]
pub struct PartitionCaps {
    /// The active isolation technology.
    pub isolation: IsolationType,
    /// Whether a paravisor mediates hypervisor access, requiring secure-call
    /// mechanisms for notification.
    pub paravisor_present: bool,
    /// Whether the partition runs nested under another hypervisor.
    pub nested: bool,
    /// ORed into GPAs published to the host on isolated partitions; zero
    /// otherwise.
    pub shared_gpa_boundary: u64,
    /// The virtual trust level of this partition.
    pub vtl: u8,
    /// The VP targeted by the handshake and host messages.
    pub connect_vp: u32,
}

/// The bundle of platform collaborators a connection is built over.
pub struct Platform {
    pub caps: PartitionCaps,
    pub message_port: Arc<dyn MessagePort>,
    pub hypercalls: Arc<dyn HypercallPort>,
    pub pages: Arc<dyn PagePool>,
    pub waiter: Arc<dyn Waiter>,
}
