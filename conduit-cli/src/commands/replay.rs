//! Replay loop: PCAP records in, packets into a sink.

use std::io::{Read, Write};

use conduit_clock::Clock;
use conduit_export::{ShutdownCheck, Sink, StatsReport, StatsSnapshot};
use conduit_packet::{Packet, Timestamp};
use pcap_file::pcap::PcapReader;

use super::CommandResult;

/// Outcome of one replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayResult {
    /// Records read from the capture and handed to the sink.
    pub packets_read: u64,
    /// Stopped early by a shutdown request.
    pub interrupted: bool,
    /// Sink counters; final once the sink is terminated.
    pub stats: StatsSnapshot,
}

/// Periodic statistics lines.
struct StatsTicker {
    interval_ms: u64,
    last_ms: u64,
    last: StatsSnapshot,
}

impl StatsTicker {
    fn new(interval_sec: u64, now_ms: u64) -> Self {
        Self {
            interval_ms: interval_sec.saturating_mul(1000),
            last_ms: now_ms,
            last: StatsSnapshot::default(),
        }
    }

    fn tick<S: Sink + ?Sized, W: Write>(&mut self, sink: &S, now_ms: u64, out: &mut W) -> CommandResult<()> {
        if self.interval_ms == 0 || now_ms < self.last_ms.saturating_add(self.interval_ms) {
            return Ok(());
        }
        let current = sink.stats();
        let report = StatsReport::new(sink.name(), now_ms / 1000, now_ms - self.last_ms, &self.last, &current);
        writeln!(out, "{}", report.to_json()?)?;
        self.last = current;
        self.last_ms = now_ms;
        Ok(())
    }
}

/// Feed every record of a PCAP capture into `sink`.
///
/// The sink must already be started; the caller terminates it. A statistics
/// line is written to `stats_out` every `stats_interval_sec` (0 disables them).
pub fn replay_capture<R, S, H, C, W>(
    input: R,
    sink: &S,
    shutdown: &H,
    clock: &C,
    stats_interval_sec: u64,
    stats_out: &mut W,
) -> CommandResult<ReplayResult>
where
    R: Read,
    S: Sink + ?Sized,
    H: ShutdownCheck,
    C: Clock,
    W: Write,
{
    let mut reader = PcapReader::new(input)?;
    let mut ticker = StatsTicker::new(stats_interval_sec, clock.now_unix_ms());
    let mut packets_read = 0;
    let mut interrupted = false;

    while let Some(record) = reader.next_packet() {
        if shutdown.should_stop() {
            interrupted = true;
            break;
        }
        let record = record?;
        let packet = Packet::builder(record.data.into_owned())
            .with_timestamp(Timestamp::from_duration(record.timestamp))
            .with_wire_len(record.orig_len)
            .parse_ethernet()
            .build()?;
        sink.receive(packet);
        packets_read += 1;

        ticker.tick(sink, clock.now_unix_ms(), stats_out)?;
    }

    Ok(ReplayResult {
        packets_read,
        interrupted,
        stats: sink.stats(),
    })
}
