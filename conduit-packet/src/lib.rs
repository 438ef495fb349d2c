//! Packet model for conduit.
//!
//! This crate provides:
//! - `Packet`, an immutable, reference-counted view over one captured frame
//! - `PacketPool`, allocation/release accounting standing in for the capture allocator
//! - `Template`, the ordered field-projection schema used to serialize packets

pub mod packet;
pub mod pool;
pub mod template;

pub use packet::{Packet, PacketBuilder, PacketError, Protocol, Timestamp};
pub use pool::PacketPool;
pub use template::{FieldBase, FieldSpec, Template, TemplateError, MIN_TEMPLATE_ID};
