//! PCAP framing for the reader pipe.
//!
//! Each reader process gets a fresh stream: the global header first, then one
//! record per packet. Bytes are staged in memory and handed to the pipe writer,
//! so a write that times out never leaves the encoder in a half-written state.

use byteorder::{BigEndian, LittleEndian};
use conduit_packet::Packet;
use pcap_file::pcap::{PcapHeader, PcapPacket};
use pcap_file::{Endianness, PcapError};

/// Size of one record header in front of the captured bytes.
pub const RECORD_HEADER_LEN: usize = 16;

/// Encoder of one PCAP stream.
#[derive(Debug, Clone)]
pub struct PcapStream {
    header: PcapHeader,
}

impl PcapStream {
    /// Start a stream; returns it with the encoded global header.
    pub fn start(snaplen: u32) -> Result<(Self, Vec<u8>), PcapError> {
        let header = PcapHeader {
            snaplen,
            ..PcapHeader::default()
        };
        let mut header_bytes = Vec::with_capacity(24);
        header.write_to(&mut header_bytes)?;
        Ok((Self { header }, header_bytes))
    }

    pub fn snaplen(&self) -> u32 {
        self.header.snaplen
    }

    /// Encode one record, truncating the captured bytes to the snapshot length.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, PcapError> {
        let data = packet.data();
        let snaplen = self.header.snaplen;
        let captured = data.len().min(snaplen as usize);
        let orig_len = packet.wire_len().max(captured as u32);
        let record = PcapPacket::new(packet.timestamp().as_duration(), orig_len, &data[..captured]);

        let mut bytes = Vec::with_capacity(RECORD_HEADER_LEN + captured);
        let resolution = self.header.ts_resolution;
        match self.header.endianness {
            Endianness::Big => record.write_to::<_, BigEndian>(&mut bytes, resolution, snaplen)?,
            Endianness::Little => record.write_to::<_, LittleEndian>(&mut bytes, resolution, snaplen)?,
        };
        Ok(bytes)
    }
}
