//! Core MQTT 3.1 protocol types: packet codec, remaining-length varint,
//! field validation, and topic filter matching.
//!
//! This crate is pure data transformation. It performs no I/O and holds no
//! locks, so it can be shared freely between transports and engines.

pub mod error;
pub mod packet;
pub mod topic;
pub mod validate;
pub mod varint;

pub use error::{ProtocolError, ValidationError};
pub use packet::{Packet, PacketType, QoS};
