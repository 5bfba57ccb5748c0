// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The guest-side VMBus connection control plane.
//!
//! This crate establishes and tears down the single logical connection
//! between a guest partition and its hosting hypervisor: it negotiates a
//! protocol version, keeps the registry of active channels, and provides
//! the message-transport and event-signaling primitives the rest of the bus
//! stack is built on.
//!
//! Ring buffers, channel offer/rescind discovery, and the raw hypercall
//! implementations are collaborators, reached through the traits in
//! [`platform`].

#![forbid(unsafe_code)]

pub mod channels;
pub mod connection;
pub mod event;
pub mod platform;
pub mod protocol;
pub mod transport;
pub mod work;

pub use channels::Channel;
pub use channels::ChannelTable;
pub use channels::DispatchResult;
pub use channels::on_event;
pub use connection::ConnectError;
pub use connection::ConnectionPhase;
pub use connection::VmbusConnection;
pub use platform::Platform;
pub use protocol::Version;
pub use transport::WaitMode;
