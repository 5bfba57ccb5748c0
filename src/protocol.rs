// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the VMBus control plane: protocol versions, channel
//! message types, the handshake message bodies, and the hypervisor status
//! codes the guest consumes.

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The SINT used for VMBus messages and events.
pub const SINT: u8 = 2;

/// Maximum size of a message posted through the hypervisor message channel,
/// including the channel message header.
pub const MAX_MESSAGE_SIZE: usize = 240;

/// The VMBus protocol versions the guest can negotiate, newest to oldest.
///
/// Values are `major << 16 | minor` as carried on the wire.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Win8 = 0x2_0004,
    Win8_1 = 0x3_0000,
    Win10 = 0x4_0000,
    Win10Rs3_1 = 0x4_0001,
    Win10Rs4 = 0x5_0000,
    Win10Rs5 = 0x5_0001,
    Iron = 0x5_0002,
    Copper = 0x5_0003,
}

impl Version {
    /// The version table iterated during negotiation, newest to oldest.
    pub const DESCENDING: &'static [Version] = &[
        Version::Copper,
        Version::Iron,
        Version::Win10Rs5,
        Version::Win10Rs4,
        Version::Win10Rs3_1,
        Version::Win10,
        Version::Win8_1,
        Version::Win8,
    ];

    /// The first version that multiplexes message connection IDs: the
    /// handshake goes out on a fixed bootstrap ID and the host returns the
    /// ID to use for everything else.
    pub const MULTIPLEXED_CONNECTION_IDS: Version = Version::Win10Rs4;

    /// The minimum version usable by an isolated partition.
    pub const ISOLATION_MINIMUM: Version = Version::Iron;

    pub fn from_wire(value: u32) -> Option<Self> {
        Self::DESCENDING.iter().copied().find(|&v| v as u32 == value)
    }

    pub fn major(&self) -> u32 {
        *self as u32 >> 16
    }

    pub fn minor(&self) -> u32 {
        *self as u32 & 0xffff
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// A channel message type, as carried in [`MessageHeader`].
///
/// Only the messages the connection control plane itself sends or consumes
/// are named here; the set is open since the host defines more.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const INITIATE_CONTACT: Self = Self(14);
    pub const VERSION_RESPONSE: Self = Self(15);
    pub const UNLOAD: Self = Self(16);
    pub const UNLOAD_COMPLETE: Self = Self(17);
}

/// A hypervisor status code, as returned by the message channel.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct HvStatus(pub u16);

impl HvStatus {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_HYPERCALL_CODE: Self = Self(2);
    pub const INSUFFICIENT_MEMORY: Self = Self(11);
    pub const INVALID_CONNECTION_ID: Self = Self(18);
    pub const INSUFFICIENT_BUFFERS: Self = Self(19);
    pub const TIMEOUT: Self = Self(0x78);
}

/// A message connection ID: the low 24 bits identify the connection.
#[bitfield(u32)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct ConnectionId {
    #[bits(24)]
    pub id: u32,
    #[bits(8)]
    _reserved: u32,
}

impl ConnectionId {
    /// The fixed connection ID used for messages on pre-Win10Rs4 hosts.
    pub const LEGACY_MESSAGE: Self = Self::new().with_id(1);
    /// The fixed bootstrap connection ID used for the `InitiateContact`
    /// message on Win10Rs4+ hosts.
    pub const BOOTSTRAP_MESSAGE: Self = Self::new().with_id(4);
}

/// The SINT/VTL advertisement packed into the `InitiateContact` field that
/// older protocol versions used for the interrupt page address.
#[bitfield(u64)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct TargetInfo {
    pub sint: u8,
    pub vtl: u8,
    #[bits(48)]
    _reserved: u64,
}

/// The signal-event hypercall number.
pub const HVCALL_SIGNAL_EVENT: u64 = 0x5d;
/// Set in the hypercall control word for a fast (register-based) call.
pub const HV_HYPERCALL_FAST_BIT: u64 = 1 << 16;
/// Set in the hypercall control word when the call targets the L0
/// hypervisor from a nested guest.
pub const HV_HYPERCALL_NESTED_BIT: u64 = 1 << 30;

/// The header preceding every channel message body.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub padding: u32,
}

/// Trait implemented by channel message bodies, associating each with its
/// message type.
pub trait VmbusMessage: Sized {
    const MESSAGE_TYPE: MessageType;
}

/// The version negotiation request.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact {
    pub version_requested: u32,
    pub target_message_vp: u32,
    /// The interrupt page GPA below [`Version::MULTIPLEXED_CONNECTION_IDS`],
    /// a [`TargetInfo`] at or above it.
    pub interrupt_page_or_target_info: u64,
    pub parent_to_child_monitor_page_gpa: u64,
    pub child_to_parent_monitor_page_gpa: u64,
}

impl VmbusMessage for InitiateContact {
    const MESSAGE_TYPE: MessageType = MessageType::INITIATE_CONTACT;
}

/// The host's reply to [`InitiateContact`].
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse {
    pub version_supported: u8,
    pub connection_state: u8,
    pub padding: u16,
    /// The message connection ID to use from now on. Only meaningful for
    /// [`Version::MULTIPLEXED_CONNECTION_IDS`] and newer.
    pub connection_id: u32,
}

impl VmbusMessage for VersionResponse {
    const MESSAGE_TYPE: MessageType = MessageType::VERSION_RESPONSE;
}

/// The unload request sent during disconnect. Header only.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Unload {}

impl VmbusMessage for Unload {
    const MESSAGE_TYPE: MessageType = MessageType::UNLOAD;
}

// Body sizes only; the header is framed separately by `OutgoingMessage`.
static_assertions::const_assert_eq!(32, size_of::<InitiateContact>());
static_assertions::const_assert_eq!(8, size_of::<VersionResponse>());

/// A fully framed outgoing channel message: header plus body, sized for the
/// hypervisor message payload limit.
#[derive(Debug, Copy, Clone)]
pub struct OutgoingMessage {
    data: [u8; MAX_MESSAGE_SIZE],
    len: usize,
}

impl OutgoingMessage {
    /// Frames `message` with its header.
    ///
    /// Panics if the message exceeds [`MAX_MESSAGE_SIZE`]; message sizes are
    /// static so this is a programming error, enforced in tests.
    pub fn new<T: VmbusMessage + IntoBytes + Immutable>(message: &T) -> Self {
        let header = MessageHeader {
            message_type: T::MESSAGE_TYPE,
            padding: 0,
        };
        let body = message.as_bytes();
        let len = size_of::<MessageHeader>() + body.len();
        assert!(len <= MAX_MESSAGE_SIZE);
        let mut data = [0; MAX_MESSAGE_SIZE];
        data[..size_of::<MessageHeader>()].copy_from_slice(header.as_bytes());
        data[size_of::<MessageHeader>()..len].copy_from_slice(body);
        OutgoingMessage { data, len }
    }

    /// The framed message bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The message type from the framed header.
    pub fn message_type(&self) -> MessageType {
        // The header was written by `new`, so the prefix always parses.
        MessageHeader::read_from_prefix(&self.data)
            .map(|(header, _)| header.message_type)
            .unwrap_or(MessageType(0))
    }
}
