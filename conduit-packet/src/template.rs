//! Field templates.
//!
//! A `Template` is the ordered list of fields an exporter projects out of every
//! packet. The order is the serialization order of each record and never changes for
//! the lifetime of the exporter that registered it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::Packet;

/// Lowest template id usable for data templates. Ids below are reserved for set ids.
pub const MIN_TEMPLATE_ID: u16 = 256;

/// Errors from template construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template id {0} is reserved (must be >= {MIN_TEMPLATE_ID})")]
    InvalidId(u16),

    #[error("template has no fields")]
    Empty,

    #[error("field {index} has zero length")]
    ZeroLength { index: usize },
}

/// Header a field offset is measured from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldBase {
    #[default]
    Frame,
    Network,
    Transport,
    Payload,
}

/// One entry of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Information element identifier.
    pub field_type: u16,
    /// Byte length of the field in every record.
    pub length: u16,
    #[serde(default)]
    pub base: FieldBase,
    /// Byte offset relative to `base`.
    pub offset: usize,
}

impl FieldSpec {
    pub fn new(field_type: u16, length: u16, base: FieldBase, offset: usize) -> Self {
        Self {
            field_type,
            length,
            base,
            offset,
        }
    }
}

/// Validated, immutable field layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    id: u16,
    fields: Vec<FieldSpec>,
    record_len: usize,
}

impl Template {
    pub fn new(id: u16, fields: Vec<FieldSpec>) -> Result<Self, TemplateError> {
        if id < MIN_TEMPLATE_ID {
            return Err(TemplateError::InvalidId(id));
        }
        if fields.is_empty() {
            return Err(TemplateError::Empty);
        }
        if let Some(index) = fields.iter().position(|f| f.length == 0) {
            return Err(TemplateError::ZeroLength { index });
        }

        let record_len = fields.iter().map(|f| usize::from(f.length)).sum();
        Ok(Self {
            id,
            fields,
            record_len,
        })
    }

    /// IPv4 five-tuple plus protocol-independent length:
    /// sourceIPv4Address, destinationIPv4Address, protocolIdentifier,
    /// sourceTransportPort, destinationTransportPort, ipTotalLength.
    pub fn ipv4_five_tuple(id: u16) -> Result<Self, TemplateError> {
        Self::new(
            id,
            vec![
                FieldSpec::new(8, 4, FieldBase::Network, 12),
                FieldSpec::new(12, 4, FieldBase::Network, 16),
                FieldSpec::new(4, 1, FieldBase::Network, 9),
                FieldSpec::new(7, 2, FieldBase::Transport, 0),
                FieldSpec::new(11, 2, FieldBase::Transport, 2),
                FieldSpec::new(224, 2, FieldBase::Network, 2),
            ],
        )
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Fixed byte length of one record.
    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// Append one record for `packet` to `out`.
    ///
    /// Fields that do not resolve within the packet are zero-filled. Returns the number
    /// of such fields.
    pub fn project(&self, packet: &Packet, out: &mut Vec<u8>) -> usize {
        let mut missing = 0;
        for field in &self.fields {
            let len = usize::from(field.length);
            match packet.field(field.base, field.offset, len) {
                Some(bytes) => out.extend_from_slice(bytes),
                None => {
                    out.resize(out.len() + len, 0);
                    missing += 1;
                }
            }
        }
        missing
    }
}
