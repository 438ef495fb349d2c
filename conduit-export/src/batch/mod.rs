//! Batched protocol export.
//!
//! Packets are projected through a template into IPFIX data records, collected in
//! a bounded pending batch, and sent to every configured collector when either the
//! count trigger or the time trigger fires.

pub mod collector;
pub mod encoder;
pub mod exporter;
pub mod pending;

pub use collector::{
    CollectorEndpoint, CollectorTransport, MockConnector, NetConnector, SentMessage, TcpTransport,
    TransportConnector, TransportError, TransportKind, UdpTransport,
};
pub use encoder::{EncoderError, IpfixEncoder, RecordEncoder, IPFIX_VERSION, MAX_MESSAGE_LEN};
pub use exporter::{BatchExporterCore, BatchedProtocolExporter, SharedCollectors};
pub use pending::PendingBatch;
