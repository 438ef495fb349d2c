//! Export stage sinks for conduit.
//!
//! This crate provides:
//! - The `Sink` contract and the worker-thread runtime shared by every sink
//! - `BatchedProtocolExporter`, batching packets into IPFIX messages for collectors
//! - `PipedProcessExporter`, streaming PCAP records into a supervised reader process
//! - Ambient seams: logging, signals, sleeping, configuration and statistics

pub mod batch;
pub mod config;
pub mod logger;
pub mod pipe;
pub mod signal;
pub mod sink;
pub mod sleeper;
pub mod stats;

pub use batch::{
    BatchedProtocolExporter, CollectorEndpoint, CollectorTransport, IpfixEncoder, NetConnector,
    RecordEncoder, TransportConnector, TransportKind,
};
pub use config::{BatchConfig, CollectorConfig, ConduitConfig, ConfigError, PipeConfig};
pub use logger::{Level, Logger, MockLogger, NullLogger, TracingLogger};
pub use pipe::{
    CommandSpec, MockSupervisor, PipeState, PipedProcessExporter, ProcessSupervisor, SupervisorError,
    UnixSupervisor,
};
pub use signal::{NeverShutdown, ProcessEvents, ShutdownCheck, ShutdownFlag, SignalError, SignalRegistration};
pub use sink::{QueueConfig, Sink, SinkError};
pub use sleeper::{MockSleeper, RealSleeper, Sleeper};
pub use stats::{SinkCounters, StatsReport, StatsSnapshot};
