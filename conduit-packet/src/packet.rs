//! Shared packet handle.
//!
//! A `Packet` is produced by the capture stage and may be held by several pipeline
//! stages at once (an exporter batching it while a flow bucket still tracks it).
//! Holders are created explicitly with [`Packet::share`] and each one gives its
//! reference back with [`Packet::release`]. The frame is destroyed, and its pool
//! notified, when the last holder releases.

use std::sync::Arc;
use std::time::Duration;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::PacketPool;
use crate::template::FieldBase;

/// Errors from packet construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("{header} offset {offset} is outside the {len}-byte frame")]
    OffsetOutOfRange {
        header: &'static str,
        offset: usize,
        len: usize,
    },

    #[error("{inner} offset {inner_offset} precedes {outer} offset {outer_offset}")]
    OffsetOrder {
        outer: &'static str,
        outer_offset: usize,
        inner: &'static str,
        inner_offset: usize,
    },
}

/// Capture timestamp with microsecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u64,
    pub usec: u32,
}

impl Timestamp {
    /// Create a timestamp, carrying whole seconds out of `usec`.
    pub fn new(sec: u64, usec: u32) -> Self {
        Self {
            sec: sec + u64::from(usec / 1_000_000),
            usec: usec % 1_000_000,
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self::new(duration.as_secs(), duration.subsec_micros())
    }

    pub fn as_duration(&self) -> Duration {
        Duration::new(self.sec, self.usec * 1000)
    }

    pub fn as_micros(&self) -> u64 {
        self.sec * 1_000_000 + u64::from(self.usec)
    }

    /// Same sub-second part, `secs` later.
    pub fn saturating_add_secs(&self, secs: u64) -> Self {
        Self {
            sec: self.sec.saturating_add(secs),
            usec: self.usec,
        }
    }
}

/// Transport protocol classification of a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HeaderOffsets {
    network: Option<usize>,
    transport: Option<usize>,
    payload: Option<usize>,
}

#[derive(Debug)]
struct PacketInner {
    timestamp: Timestamp,
    data: Vec<u8>,
    wire_len: u32,
    offsets: HeaderOffsets,
    protocol: Protocol,
    pool: Option<PacketPool>,
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.on_release();
        }
    }
}

/// One holder's reference to a captured frame.
///
/// Not `Clone`: a new holder must be created with [`Packet::share`], and
/// [`Packet::release`] consumes the handle, so each holder releases exactly once.
/// Dropping a handle has the same effect as releasing it.
#[derive(Debug)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    /// Start building a packet without pool accounting.
    pub fn builder(data: Vec<u8>) -> PacketBuilder {
        PacketBuilder::new(data)
    }

    /// Build a packet from an Ethernet frame, deriving header offsets and protocol.
    pub fn from_ethernet(timestamp: Timestamp, data: Vec<u8>) -> Packet {
        PacketBuilder::new(data)
            .with_timestamp(timestamp)
            .parse_ethernet()
            .build_parsed()
    }

    /// Take an additional reference for another holder.
    pub fn share(&self) -> Packet {
        Packet {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Give this holder's reference back.
    ///
    /// Returns `true` when this was the last holder and the frame was destroyed.
    pub fn release(self) -> bool {
        Arc::into_inner(self.inner).is_some()
    }

    /// Number of holders currently referencing the frame.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.inner.timestamp
    }

    /// Captured bytes.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    /// Number of captured bytes.
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Length of the frame on the wire (at least the captured length).
    pub fn wire_len(&self) -> u32 {
        self.inner.wire_len
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    pub fn network_offset(&self) -> Option<usize> {
        self.inner.offsets.network
    }

    pub fn transport_offset(&self) -> Option<usize> {
        self.inner.offsets.transport
    }

    pub fn payload_offset(&self) -> Option<usize> {
        self.inner.offsets.payload
    }

    /// Bytes `[base + offset, base + offset + len)` of the frame.
    ///
    /// Returns `None` when the base header was not parsed or the range runs past the
    /// captured bytes.
    pub fn field(&self, base: FieldBase, offset: usize, len: usize) -> Option<&[u8]> {
        let start = match base {
            FieldBase::Frame => 0,
            FieldBase::Network => self.network_offset()?,
            FieldBase::Transport => self.transport_offset()?,
            FieldBase::Payload => self.payload_offset()?,
        }
        .checked_add(offset)?;
        let end = start.checked_add(len)?;
        self.inner.data.get(start..end)
    }
}

/// Builder for [`Packet`].
#[derive(Debug)]
pub struct PacketBuilder {
    timestamp: Timestamp,
    data: Vec<u8>,
    wire_len: Option<u32>,
    offsets: HeaderOffsets,
    protocol: Protocol,
    pool: Option<PacketPool>,
}

impl PacketBuilder {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            timestamp: Timestamp::default(),
            data,
            wire_len: None,
            offsets: HeaderOffsets::default(),
            protocol: Protocol::Other,
            pool: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Original length on the wire, for truncated captures.
    pub fn with_wire_len(mut self, wire_len: u32) -> Self {
        self.wire_len = Some(wire_len);
        self
    }

    pub fn with_network_offset(mut self, offset: usize) -> Self {
        self.offsets.network = Some(offset);
        self
    }

    pub fn with_transport_offset(mut self, offset: usize) -> Self {
        self.offsets.transport = Some(offset);
        self
    }

    pub fn with_payload_offset(mut self, offset: usize) -> Self {
        self.offsets.payload = Some(offset);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_pool(mut self, pool: PacketPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Derive header offsets and protocol from the data as an Ethernet frame.
    ///
    /// Frames that are not IPv4/IPv6 over Ethernet keep no offsets and `Protocol::Other`.
    pub fn parse_ethernet(mut self) -> Self {
        let (offsets, protocol) = classify_ethernet(&self.data);
        self.offsets = offsets;
        self.protocol = protocol;
        self
    }

    /// Validate the offsets and build the packet.
    pub fn build(self) -> Result<Packet, PacketError> {
        let len = self.data.len();
        let layers = [
            ("network", self.offsets.network),
            ("transport", self.offsets.transport),
            ("payload", self.offsets.payload),
        ];

        for (header, offset) in layers {
            if let Some(offset) = offset {
                if offset > len {
                    return Err(PacketError::OffsetOutOfRange { header, offset, len });
                }
            }
        }

        let present: Vec<(&'static str, usize)> = layers
            .iter()
            .filter_map(|(name, offset)| offset.map(|o| (*name, o)))
            .collect();
        for pair in present.windows(2) {
            let (outer, outer_offset) = pair[0];
            let (inner, inner_offset) = pair[1];
            if inner_offset < outer_offset {
                return Err(PacketError::OffsetOrder {
                    outer,
                    outer_offset,
                    inner,
                    inner_offset,
                });
            }
        }

        Ok(self.build_parsed())
    }

    // Offsets produced by `classify_ethernet` are sub-slices of the frame and need no
    // re-validation.
    fn build_parsed(self) -> Packet {
        if let Some(pool) = &self.pool {
            pool.on_allocate();
        }
        let wire_len = self
            .wire_len
            .unwrap_or(self.data.len() as u32)
            .max(self.data.len() as u32);
        Packet {
            inner: Arc::new(PacketInner {
                timestamp: self.timestamp,
                data: self.data,
                wire_len,
                offsets: self.offsets,
                protocol: self.protocol,
                pool: self.pool,
            }),
        }
    }
}

fn offset_within(frame: &[u8], part: &[u8]) -> Option<usize> {
    let base = frame.as_ptr() as usize;
    let start = part.as_ptr() as usize;
    (start >= base && start + part.len() <= base + frame.len()).then(|| start - base)
}

fn classify_ethernet(frame: &[u8]) -> (HeaderOffsets, Protocol) {
    let mut offsets = HeaderOffsets::default();
    let sliced = match SlicedPacket::from_ethernet(frame) {
        Ok(sliced) => sliced,
        Err(_) => return (offsets, Protocol::Other),
    };

    let (net_header, ip_payload) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (ipv4.header().slice(), ipv4.payload().payload),
        Some(NetSlice::Ipv6(ipv6)) => (ipv6.header().slice(), ipv6.payload().payload),
        _ => return (offsets, Protocol::Other),
    };
    offsets.network = offset_within(frame, net_header);
    offsets.transport = offset_within(frame, ip_payload);

    let protocol = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            offsets.payload = offset_within(frame, tcp.payload());
            Protocol::Tcp
        }
        Some(TransportSlice::Udp(udp)) => {
            offsets.payload = offset_within(frame, udp.payload());
            Protocol::Udp
        }
        Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => Protocol::Icmp,
        _ => Protocol::Other,
    };

    (offsets, protocol)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Ethernet + IPv4 + UDP (10.0.0.1:1234 -> 10.0.0.2:53) with a 4-byte payload.
    pub(crate) fn udp_frame() -> Vec<u8> {
        let mut frame = vec![
            // Ethernet: dst, src, ethertype IPv4
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0x08, 0x00,
            // IPv4: ver/ihl, tos, total len 32, id, flags/frag, ttl, proto UDP, checksum
            0x45, 0x00, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00,
            // src 10.0.0.1, dst 10.0.0.2
            10, 0, 0, 1, 10, 0, 0, 2,
            // UDP: src port 1234, dst port 53, len 12, checksum
            0x04, 0xd2, 0x00, 0x35, 0x00, 0x0c, 0x00, 0x00,
        ];
        frame.extend_from_slice(b"ping");
        frame
    }

    // ===========================================
    // Timestamp Tests
    // ===========================================

    #[test]
    fn test_timestamp_normalizes_micros() {
        let ts = Timestamp::new(10, 2_500_000);
        assert_eq!(ts, Timestamp { sec: 12, usec: 500_000 });
    }

    #[test]
    fn test_timestamp_duration_conversion() {
        let ts = Timestamp::from_duration(Duration::from_micros(3_000_042));
        assert_eq!(ts, Timestamp::new(3, 42));
        assert_eq!(ts.as_duration(), Duration::from_micros(3_000_042));
        assert_eq!(ts.as_micros(), 3_000_042);
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::new(1, 999_999) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 1) > Timestamp::new(2, 0));
    }

    #[test]
    fn test_timestamp_add_secs() {
        let ts = Timestamp::new(100, 7).saturating_add_secs(60);
        assert_eq!(ts, Timestamp::new(160, 7));
        assert_eq!(Timestamp::new(u64::MAX, 0).saturating_add_secs(1).sec, u64::MAX);
    }

    // ===========================================
    // Reference Counting Tests
    // ===========================================

    #[test]
    fn test_share_and_release_defer_destruction() {
        let pool = PacketPool::new();
        let packet = pool.builder(vec![0u8; 64]).build().expect("build");
        let second = packet.share();
        assert_eq!(packet.holders(), 2);

        assert!(!packet.release());
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(second.holders(), 1);

        assert!(second.release());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.released(), 1);
    }

    #[test]
    fn test_release_across_threads() {
        let pool = PacketPool::new();
        let packet = pool.builder(vec![0u8; 64]).build().expect("build");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let held = packet.share();
                std::thread::spawn(move || held.release())
            })
            .collect();
        let last_in_threads = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|last| *last)
            .count();
        let last_here = packet.release();
        assert_eq!(last_in_threads + usize::from(last_here), 1);
        assert_eq!(pool.released(), 1);
    }

    #[test]
    fn test_drop_counts_as_release() {
        let pool = PacketPool::new();
        let packet = pool.builder(vec![1]).build().expect("build");
        drop(packet);
        assert_eq!(pool.outstanding(), 0);
    }

    // ===========================================
    // Builder Tests
    // ===========================================

    #[test]
    fn test_builder_sets_metadata() {
        let packet = Packet::builder(vec![0u8; 100])
            .with_timestamp(Timestamp::new(5, 6))
            .with_wire_len(1500)
            .with_network_offset(14)
            .with_transport_offset(34)
            .with_payload_offset(54)
            .with_protocol(Protocol::Tcp)
            .build()
            .expect("build");

        assert_eq!(packet.timestamp(), Timestamp::new(5, 6));
        assert_eq!(packet.len(), 100);
        assert_eq!(packet.wire_len(), 1500);
        assert_eq!(packet.network_offset(), Some(14));
        assert_eq!(packet.transport_offset(), Some(34));
        assert_eq!(packet.payload_offset(), Some(54));
        assert_eq!(packet.protocol(), Protocol::Tcp);
    }

    #[test]
    fn test_wire_len_never_below_captured() {
        let packet = Packet::builder(vec![0u8; 100])
            .with_wire_len(10)
            .build()
            .expect("build");
        assert_eq!(packet.wire_len(), 100);
    }

    #[test]
    fn test_builder_rejects_offset_past_end() {
        let err = Packet::builder(vec![0u8; 20])
            .with_network_offset(14)
            .with_transport_offset(40)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            PacketError::OffsetOutOfRange {
                header: "transport",
                offset: 40,
                len: 20
            }
        );
    }

    #[test]
    fn test_builder_rejects_inverted_offsets() {
        let err = Packet::builder(vec![0u8; 64])
            .with_network_offset(34)
            .with_transport_offset(14)
            .build()
            .unwrap_err();
        assert!(matches!(err, PacketError::OffsetOrder { .. }));
        assert!(err.to_string().contains("precedes"));
    }

    // ===========================================
    // Field Resolution Tests
    // ===========================================

    #[test]
    fn test_field_relative_to_headers() {
        let packet = Packet::builder((0u8..64).collect())
            .with_network_offset(14)
            .with_transport_offset(34)
            .build()
            .expect("build");

        assert_eq!(packet.field(FieldBase::Frame, 0, 2), Some(&[0u8, 1][..]));
        assert_eq!(packet.field(FieldBase::Network, 12, 4), Some(&[26u8, 27, 28, 29][..]));
        assert_eq!(packet.field(FieldBase::Transport, 2, 2), Some(&[36u8, 37][..]));
    }

    #[test]
    fn test_field_missing_header_or_short_frame() {
        let packet = Packet::builder(vec![0u8; 20])
            .with_network_offset(14)
            .build()
            .expect("build");
        assert_eq!(packet.field(FieldBase::Transport, 0, 2), None);
        assert_eq!(packet.field(FieldBase::Network, 4, 4), None);
        assert_eq!(packet.field(FieldBase::Frame, usize::MAX, 2), None);
    }

    // ===========================================
    // Ethernet Classification Tests
    // ===========================================

    #[test]
    fn test_from_ethernet_udp() {
        let packet = Packet::from_ethernet(Timestamp::new(1, 0), udp_frame());
        assert_eq!(packet.protocol(), Protocol::Udp);
        assert_eq!(packet.network_offset(), Some(14));
        assert_eq!(packet.transport_offset(), Some(34));
        assert_eq!(packet.payload_offset(), Some(42));
        assert_eq!(packet.field(FieldBase::Payload, 0, 4), Some(&b"ping"[..]));
    }

    #[test]
    fn test_from_ethernet_garbage_has_no_offsets() {
        let packet = Packet::from_ethernet(Timestamp::default(), vec![0xff; 8]);
        assert_eq!(packet.protocol(), Protocol::Other);
        assert_eq!(packet.network_offset(), None);
        assert_eq!(packet.transport_offset(), None);
    }

    #[test]
    fn test_parse_ethernet_with_pool() {
        let pool = PacketPool::new();
        let packet = pool
            .builder(udp_frame())
            .parse_ethernet()
            .build()
            .expect("build");
        assert_eq!(packet.protocol(), Protocol::Udp);
        assert_eq!(pool.outstanding(), 1);
        packet.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_protocol_serde_lowercase() {
        let json = serde_json::to_string(&Protocol::Tcp).expect("serialize");
        assert_eq!(json, "\"tcp\"");
    }
}
