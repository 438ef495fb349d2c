//! Record encoding.
//!
//! `RecordEncoder` is the serialization seam of the batched exporter. The shipped
//! `IpfixEncoder` frames messages the way IPFIX does: a 16-byte message header, the
//! template set (repeated in every message so collectors that join late can decode)
//! and one data set holding the records of the batch.

use conduit_packet::{Packet, Template};
use thiserror::Error;

/// IPFIX protocol version carried in every message header.
pub const IPFIX_VERSION: u16 = 10;
/// Largest message the 16-bit length field can describe.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

const MESSAGE_HEADER_LEN: usize = 16;
const SET_HEADER_LEN: usize = 4;
const TEMPLATE_RECORD_HEADER_LEN: usize = 4;
const FIELD_SPECIFIER_LEN: usize = 4;
const TEMPLATE_SET_ID: u16 = 2;

/// Errors from record encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncoderError {
    #[error("worst-case message of {worst_case} bytes exceeds the {limit}-byte limit")]
    MessageTooLarge { worst_case: usize, limit: usize },

    #[error("no template registered")]
    NoTemplate,

    #[error("no data set open")]
    NoDataSet,

    #[error("message already holds {max_records} records")]
    MessageFull { max_records: usize },
}

/// Serializes packets into messages.
pub trait RecordEncoder: Send {
    /// Register the template every later record is encoded with.
    fn register_template(&mut self, template: &Template) -> Result<(), EncoderError>;

    /// Open a new message and its data set.
    fn start_data_set(&mut self) -> Result<(), EncoderError>;

    /// Append the record for `packet`. Returns the number of zero-filled fields.
    fn put_record(&mut self, packet: &Packet) -> Result<usize, EncoderError>;

    /// Close the open data set.
    fn end_data_set(&mut self) -> Result<(), EncoderError>;

    /// Complete the message and return its bytes.
    fn finish_message(&mut self, export_time_sec: u32) -> Result<Vec<u8>, EncoderError>;

    /// Records in the message being built.
    fn records_in_message(&self) -> usize;
}

/// IPFIX message encoder.
#[derive(Debug)]
pub struct IpfixEncoder {
    observation_domain_id: u32,
    max_records: usize,
    template: Option<Template>,
    template_set: Vec<u8>,
    buffer: Vec<u8>,
    data_set_start: Option<usize>,
    records: usize,
    sequence: u32,
}

impl IpfixEncoder {
    /// Encoder for messages of at most `max_records` records.
    pub fn new(observation_domain_id: u32, max_records: usize) -> Self {
        Self {
            observation_domain_id,
            max_records,
            template: None,
            template_set: Vec::new(),
            buffer: Vec::new(),
            data_set_start: None,
            records: 0,
            sequence: 0,
        }
    }

    /// Sequence number the next message will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    fn encode_template_set(template: &Template) -> Vec<u8> {
        let len = SET_HEADER_LEN
            + TEMPLATE_RECORD_HEADER_LEN
            + template.field_count() * FIELD_SPECIFIER_LEN;
        let mut set = Vec::with_capacity(len);
        set.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&(len as u16).to_be_bytes());
        set.extend_from_slice(&template.id().to_be_bytes());
        set.extend_from_slice(&(template.field_count() as u16).to_be_bytes());
        for field in template.fields() {
            set.extend_from_slice(&field.field_type.to_be_bytes());
            set.extend_from_slice(&field.length.to_be_bytes());
        }
        set
    }
}

impl RecordEncoder for IpfixEncoder {
    fn register_template(&mut self, template: &Template) -> Result<(), EncoderError> {
        let template_set = Self::encode_template_set(template);
        let worst_case = MESSAGE_HEADER_LEN
            + template_set.len()
            + SET_HEADER_LEN
            + self.max_records.saturating_mul(template.record_len());
        if worst_case > MAX_MESSAGE_LEN {
            return Err(EncoderError::MessageTooLarge {
                worst_case,
                limit: MAX_MESSAGE_LEN,
            });
        }

        self.buffer = Vec::with_capacity(worst_case);
        self.template_set = template_set;
        self.template = Some(template.clone());
        Ok(())
    }

    fn start_data_set(&mut self) -> Result<(), EncoderError> {
        let template = self.template.as_ref().ok_or(EncoderError::NoTemplate)?;

        self.buffer.clear();
        self.buffer.resize(MESSAGE_HEADER_LEN, 0);
        self.buffer.extend_from_slice(&self.template_set);
        self.data_set_start = Some(self.buffer.len());
        self.buffer.extend_from_slice(&template.id().to_be_bytes());
        self.buffer.extend_from_slice(&[0, 0]);
        self.records = 0;
        Ok(())
    }

    fn put_record(&mut self, packet: &Packet) -> Result<usize, EncoderError> {
        let template = self.template.as_ref().ok_or(EncoderError::NoTemplate)?;
        if self.data_set_start.is_none() {
            return Err(EncoderError::NoDataSet);
        }
        if self.records >= self.max_records {
            return Err(EncoderError::MessageFull {
                max_records: self.max_records,
            });
        }

        let missing = template.project(packet, &mut self.buffer);
        self.records += 1;
        Ok(missing)
    }

    fn end_data_set(&mut self) -> Result<(), EncoderError> {
        let start = self.data_set_start.ok_or(EncoderError::NoDataSet)?;
        let len = (self.buffer.len() - start) as u16;
        self.buffer[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    fn finish_message(&mut self, export_time_sec: u32) -> Result<Vec<u8>, EncoderError> {
        let start = self.data_set_start.take().ok_or(EncoderError::NoDataSet)?;
        if self.records == 0 {
            // An empty data set is not sent.
            self.buffer.truncate(start);
        }

        let len = self.buffer.len() as u16;
        self.buffer[0..2].copy_from_slice(&IPFIX_VERSION.to_be_bytes());
        self.buffer[2..4].copy_from_slice(&len.to_be_bytes());
        self.buffer[4..8].copy_from_slice(&export_time_sec.to_be_bytes());
        self.buffer[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        self.buffer[12..16].copy_from_slice(&self.observation_domain_id.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(self.records as u32);
        self.records = 0;
        Ok(std::mem::take(&mut self.buffer))
    }

    fn records_in_message(&self) -> usize {
        self.records
    }
}
