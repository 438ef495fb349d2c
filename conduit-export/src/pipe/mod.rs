//! Piped process export: PCAP over a pipe into a supervised reader process.

pub mod exporter;
pub mod mock;
pub mod pcap_stream;
pub mod supervisor;
pub mod unix;

pub use exporter::{PipeExporterCore, PipeState, PipedProcessExporter};
pub use mock::{MockSupervisor, MockWriteFailure, ProcessEvent};
pub use pcap_stream::PcapStream;
pub use supervisor::{
    CommandSpec, PipeWriteError, PipeWriter, ProcessSupervisor, SpawnedProcess, SupervisorError,
};
pub use unix::{descendants_of, parse_stat_ppid, UnixPipeWriter, UnixSupervisor};
