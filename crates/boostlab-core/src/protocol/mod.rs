//! ECU Link & Protocol
//!
//! Byte framing, request/reply codec, link transport with reconnect, and
//! the serialized half-duplex channel that owns the physical link.

pub mod channel;
pub mod codec;
mod error;
pub mod frame;
mod link;
pub mod serial;

pub use channel::{EcuChannel, EcuHandle, Priority};
pub use codec::{FreezeFrameEntry, Message, Request};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFault, FRAME_OVERHEAD, MAX_PAYLOAD_SIZE, START_MARKER};
pub use link::{CommunicationChannel, Link, LinkConfig, LinkEvent, LinkState, SerialChannel};
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};

/// Default baud rate for the ECU adapter
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for one request/reply exchange in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
