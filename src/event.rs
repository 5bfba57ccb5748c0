// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outbound event signaling: tells the host a channel's ring has data.
//!
//! Exactly one low-level notification mechanism applies per partition,
//! chosen from the capabilities cached at construction rather than probed
//! per call: a direct fast hypercall normally, or one of the secure-call
//! paths when a paravisor mediates hypervisor access.

use crate::channels::Channel;
use crate::connection::VmbusConnection;
use crate::platform::IsolationType;
use crate::platform::PAGE_SIZE;
use crate::protocol::HVCALL_SIGNAL_EVENT;
use crate::protocol::HV_HYPERCALL_FAST_BIT;
use crate::protocol::HV_HYPERCALL_NESTED_BIT;

impl VmbusConnection {
    /// Sends an event notification for `channel` to the host.
    pub fn signal_event(&self, channel: &Channel) {
        if !channel.has_dedicated_interrupt() {
            self.send_interrupt(channel.relid());
        }
        channel.count_signal();

        let caps = &self.platform.caps;
        let port = &self.platform.hypercalls;
        if caps.paravisor_present {
            match caps.isolation {
                IsolationType::Snp => {
                    port.ghcb_hypercall(HVCALL_SIGNAL_EVENT, channel.sig_event());
                }
                IsolationType::Tdx => {
                    port.tdx_hypercall(
                        HVCALL_SIGNAL_EVENT | HV_HYPERCALL_FAST_BIT,
                        channel.sig_event(),
                    );
                }
                IsolationType::None => {
                    // A paravisor with no recognized isolation technology
                    // has no signaling path at all. Make noise; dropping
                    // signals silently would hang the channel.
                    tracing::error!(
                        relid = channel.relid(),
                        "paravisor present but no isolation mechanism to signal through"
                    );
                }
            }
        } else {
            let mut control = HVCALL_SIGNAL_EVENT;
            if caps.nested {
                control |= HV_HYPERCALL_NESTED_BIT;
            }
            port.fast_hypercall8(control, channel.sig_event());
        }
    }

    /// Sets `relid`'s bit in the send half of the interrupt page,
    /// fire-and-forget. A no-op when the page is not allocated.
    pub fn send_interrupt(&self, relid: u32) {
        if let Some(page) = self.interrupt_page.load_full() {
            page.set_bit(PAGE_SIZE * 8 / 2 + relid as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::CallbackMode;
    use crate::platform::GuestPage;
    use crate::platform::HypercallPort;
    use crate::platform::PartitionCaps;
    use crate::platform::Platform;
    use crate::connection::tests::TestPagePool;
    use crate::connection::tests::NullMessagePort;
    use crate::platform::StdWaiter;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Fast(u64, u64),
        Ghcb(u64, u64),
        Tdx(u64, u64),
    }

    #[derive(Default)]
    struct RecordingHypercalls {
        calls: Mutex<Vec<Call>>,
    }

    impl HypercallPort for RecordingHypercalls {
        fn fast_hypercall8(&self, control: u64, input: u64) {
            self.calls.lock().push(Call::Fast(control, input));
        }

        fn ghcb_hypercall(&self, control: u64, input: u64) {
            self.calls.lock().push(Call::Ghcb(control, input));
        }

        fn tdx_hypercall(&self, control: u64, input: u64) {
            self.calls.lock().push(Call::Tdx(control, input));
        }
    }

    fn connection(caps: PartitionCaps) -> (VmbusConnection, Arc<RecordingHypercalls>) {
        let hypercalls = Arc::new(RecordingHypercalls::default());
        let platform = Platform {
            caps,
            message_port: Arc::new(NullMessagePort),
            hypercalls: hypercalls.clone(),
            pages: Arc::new(TestPagePool::default()),
            waiter: Arc::new(StdWaiter),
        };
        (VmbusConnection::builder(platform).build(), hypercalls)
    }

    fn channel(dedicated: bool) -> Channel {
        Channel::new(7, CallbackMode::Direct, dedicated, 0xcafe, None)
    }

    #[test]
    fn direct_hypercall_when_no_paravisor() {
        let (conn, hypercalls) = connection(PartitionCaps::default());
        let channel = channel(true);
        conn.signal_event(&channel);
        assert_eq!(
            &*hypercalls.calls.lock(),
            &[Call::Fast(HVCALL_SIGNAL_EVENT, 0xcafe)]
        );
        assert_eq!(channel.signal_count(), 1);
    }

    #[test]
    fn nested_bit_set_when_nested() {
        let (conn, hypercalls) = connection(PartitionCaps {
            nested: true,
            ..Default::default()
        });
        conn.signal_event(&channel(true));
        assert_eq!(
            &*hypercalls.calls.lock(),
            &[Call::Fast(HVCALL_SIGNAL_EVENT | HV_HYPERCALL_NESTED_BIT, 0xcafe)]
        );
    }

    #[test]
    fn snp_paravisor_uses_ghcb() {
        let (conn, hypercalls) = connection(PartitionCaps {
            isolation: IsolationType::Snp,
            paravisor_present: true,
            ..Default::default()
        });
        conn.signal_event(&channel(true));
        assert_eq!(
            &*hypercalls.calls.lock(),
            &[Call::Ghcb(HVCALL_SIGNAL_EVENT, 0xcafe)]
        );
    }

    #[test]
    fn tdx_paravisor_uses_tdcall() {
        let (conn, hypercalls) = connection(PartitionCaps {
            isolation: IsolationType::Tdx,
            paravisor_present: true,
            ..Default::default()
        });
        conn.signal_event(&channel(true));
        assert_eq!(
            &*hypercalls.calls.lock(),
            &[Call::Tdx(HVCALL_SIGNAL_EVENT | HV_HYPERCALL_FAST_BIT, 0xcafe)]
        );
    }

    #[test]
    fn paravisor_without_isolation_signals_nothing() {
        let (conn, hypercalls) = connection(PartitionCaps {
            paravisor_present: true,
            ..Default::default()
        });
        conn.signal_event(&channel(true));
        assert!(hypercalls.calls.lock().is_empty());
    }

    #[test]
    fn non_dedicated_interrupt_sets_send_page_bit() {
        let (conn, _) = connection(PartitionCaps::default());
        let page = Arc::new(GuestPage::new(0x5000));
        conn.interrupt_page.store(Some(page.clone()));
        let channel = channel(false);
        conn.signal_event(&channel);
        assert!(page.bit(PAGE_SIZE * 8 / 2 + 7));
        // Receive half untouched.
        assert!(!page.bit(7));
    }

    #[test]
    fn dedicated_interrupt_skips_send_page() {
        let (conn, _) = connection(PartitionCaps::default());
        let page = Arc::new(GuestPage::new(0x5000));
        conn.interrupt_page.store(Some(page.clone()));
        conn.signal_event(&channel(true));
        assert!(!page.bit(PAGE_SIZE * 8 / 2 + 7));
    }
}
