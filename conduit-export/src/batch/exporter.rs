//! Batched protocol exporter.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use conduit_clock::{Clock, SystemClock};
use conduit_packet::{Packet, Template};

use crate::batch::collector::{
    CollectorEndpoint, CollectorTransport, NetConnector, TransportConnector, TransportKind,
};
use crate::batch::encoder::{IpfixEncoder, RecordEncoder};
use crate::batch::pending::PendingBatch;
use crate::config::BatchConfig;
use crate::logger::Logger;
use crate::signal::ShutdownCheck;
use crate::sink::{QueueConfig, Sink, SinkError, SinkHandler, SinkWorker};
use crate::stats::{SinkCounters, StatsSnapshot};

/// Worker wait while the batch is empty.
const IDLE_WAKEUP: Duration = Duration::from_secs(1);

/// Collector list shared between the facade and the worker.
pub type SharedCollectors = Arc<Mutex<Vec<Box<dyn CollectorTransport>>>>;

fn lock_collectors(collectors: &SharedCollectors) -> MutexGuard<'_, Vec<Box<dyn CollectorTransport>>> {
    collectors.lock().unwrap_or_else(|e| e.into_inner())
}

/// Batching state machine run on the exporter's worker.
///
/// The caller is expected to have validated the configuration; the pending
/// capacity is still enforced on every `add_packet`.
pub struct BatchExporterCore<E: RecordEncoder> {
    encoder: E,
    clock: Arc<dyn Clock>,
    pending: PendingBatch,
    max_packets: usize,
    lifetime_ms: u64,
    oldest_ms: Option<u64>,
    stream_open: bool,
    collectors: SharedCollectors,
    counters: Arc<SinkCounters>,
    logger: Arc<dyn Logger>,
}

impl<E: RecordEncoder> BatchExporterCore<E> {
    pub fn new(
        config: &BatchConfig,
        template: &Template,
        mut encoder: E,
        clock: Arc<dyn Clock>,
        collectors: SharedCollectors,
        counters: Arc<SinkCounters>,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, SinkError> {
        encoder.register_template(template)?;
        Ok(Self {
            encoder,
            clock,
            pending: PendingBatch::new(config.pending_capacity),
            max_packets: config.max_packets_per_message,
            lifetime_ms: config.max_packet_lifetime_ms,
            oldest_ms: None,
            stream_open: false,
            collectors,
            counters,
            logger,
        })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Wall-clock time (Unix ms) at which the current batch must be flushed.
    pub fn flush_deadline_ms(&self) -> Option<u64> {
        self.oldest_ms.map(|t| t.saturating_add(self.lifetime_ms))
    }

    /// Open a new message.
    pub fn start_new_packet_stream(&mut self) -> Result<(), SinkError> {
        self.encoder.start_data_set()?;
        self.oldest_ms = None;
        self.stream_open = true;
        Ok(())
    }

    /// Serialize `packet` into the current message and keep it until the flush.
    pub fn add_packet(&mut self, packet: Packet) -> Result<(), SinkError> {
        if self.pending.is_full() {
            self.drop_packet(packet);
            return Err(SinkError::BatchOverflow {
                capacity: self.pending.capacity(),
            });
        }

        if !self.stream_open {
            if let Err(e) = self.start_new_packet_stream() {
                self.drop_packet(packet);
                return Err(e);
            }
        }

        let missing = match self.encoder.put_record(&packet) {
            Ok(missing) => missing,
            Err(e) => {
                self.drop_packet(packet);
                return Err(e.into());
            }
        };
        self.counters.record_missing_fields(missing);

        if self.pending.is_empty() {
            self.oldest_ms = Some(self.clock.now_unix_ms());
        }
        if let Err(packet) = self.pending.try_push(packet) {
            self.drop_packet(packet);
            return Err(SinkError::BatchOverflow {
                capacity: self.pending.capacity(),
            });
        }

        if self.pending.len() >= self.max_packets {
            self.flush_packet_stream()?;
        }
        Ok(())
    }

    /// Finish the current message, send it to every collector and release the batch.
    pub fn flush_packet_stream(&mut self) -> Result<(), SinkError> {
        if !self.stream_open {
            return Ok(());
        }
        self.stream_open = false;
        self.oldest_ms = None;

        let records = self.encoder.records_in_message();
        let export_time = (self.clock.now_unix_ms() / 1000) as u32;
        let encoded = self
            .encoder
            .end_data_set()
            .and_then(|_| self.encoder.finish_message(export_time));
        let message = match encoded {
            Ok(message) => message,
            Err(e) => {
                for packet in self.pending.take_all() {
                    self.drop_packet(packet);
                }
                return Err(e.into());
            }
        };

        if records == 0 {
            return Ok(());
        }

        let sent_to = self.send_to_collectors(&message);
        self.counters.record_message();

        let (released, bytes) = self.pending.release_all();
        self.counters.record_forwarded_batch(released, bytes);
        self.logger.debug(&format!(
            "flushed {records} records ({} bytes) to {sent_to} collectors",
            message.len()
        ));
        Ok(())
    }

    fn send_to_collectors(&self, message: &[u8]) -> usize {
        let mut collectors = lock_collectors(&self.collectors);
        let mut delivered = 0;
        for collector in collectors.iter_mut() {
            match collector.send(message) {
                Ok(()) => delivered += 1,
                Err(e) => self.logger.warn(&format!("collector send failed: {e}")),
            }
        }
        delivered
    }

    fn drop_packet(&self, packet: Packet) {
        packet.release();
        self.counters.record_dropped();
    }

    fn flush_due(&self) -> bool {
        self.flush_deadline_ms()
            .is_some_and(|deadline| self.clock.now_unix_ms() >= deadline)
    }
}

impl<E: RecordEncoder + 'static> SinkHandler for BatchExporterCore<E> {
    fn on_start(&mut self) -> Result<(), SinkError> {
        self.logger.info(&format!(
            "ipfix exporter started: {} packets per message, {} ms lifetime, {} collectors",
            self.max_packets,
            self.lifetime_ms,
            lock_collectors(&self.collectors).len()
        ));
        Ok(())
    }

    fn on_packet(&mut self, packet: Packet) -> Result<(), SinkError> {
        self.add_packet(packet)
    }

    fn on_tick(&mut self) -> Result<(), SinkError> {
        if self.flush_due() {
            self.flush_packet_stream()?;
        }
        Ok(())
    }

    fn next_wakeup(&self) -> Duration {
        match self.flush_deadline_ms() {
            Some(deadline) => {
                Duration::from_millis(deadline.saturating_sub(self.clock.now_unix_ms()))
            }
            None => IDLE_WAKEUP,
        }
    }

    fn on_shutdown(&mut self) -> Result<(), SinkError> {
        let result = self.flush_packet_stream();
        self.logger.info("ipfix exporter stopped");
        result
    }
}

/// Sink that batches packets into protocol messages for network collectors.
pub struct BatchedProtocolExporter<E: RecordEncoder + 'static = IpfixEncoder> {
    worker: SinkWorker<BatchExporterCore<E>>,
    collectors: SharedCollectors,
    connector: Box<dyn TransportConnector>,
    logger: Arc<dyn Logger>,
}

impl BatchedProtocolExporter<IpfixEncoder> {
    /// Exporter with the IPFIX encoder, the system clock and real sockets.
    pub fn new(config: BatchConfig, logger: Arc<dyn Logger>) -> Result<Self, SinkError> {
        let template = config.template()?;
        let encoder = IpfixEncoder::new(config.observation_domain_id, config.max_packets_per_message);
        Self::with_components(
            config,
            template,
            encoder,
            Arc::new(SystemClock),
            Box::new(NetConnector),
            logger,
        )
    }
}

impl<E: RecordEncoder + 'static> BatchedProtocolExporter<E> {
    pub fn with_components(
        config: BatchConfig,
        template: Template,
        encoder: E,
        clock: Arc<dyn Clock>,
        connector: Box<dyn TransportConnector>,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, SinkError> {
        config.validate()?;

        let collectors: SharedCollectors = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(SinkCounters::new());
        let core = BatchExporterCore::new(
            &config,
            &template,
            encoder,
            clock,
            Arc::clone(&collectors),
            Arc::clone(&counters),
            Arc::clone(&logger),
        )?;
        let queue = QueueConfig {
            capacity: config.queue_capacity,
            enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
        };

        let exporter = Self {
            worker: SinkWorker::new("ipfix", core, queue, counters),
            collectors,
            connector,
            logger,
        };
        for collector in &config.collectors {
            exporter.add_collector(&collector.address, collector.port, &collector.transport);
        }
        Ok(exporter)
    }

    /// Add a collector. `transport` is "TCP" or "UDP" in any case.
    ///
    /// Returns false, leaving the collector list unchanged, when the transport is
    /// unknown or the endpoint cannot be resolved or opened.
    pub fn add_collector(&self, address: &str, port: u16, transport: &str) -> bool {
        let collector = transport
            .parse::<TransportKind>()
            .and_then(|kind| CollectorEndpoint::resolve(address, port, kind))
            .and_then(|endpoint| self.connector.connect(endpoint));

        match collector {
            Ok(collector) => {
                self.logger
                    .info(&format!("added collector {}", collector.endpoint()));
                lock_collectors(&self.collectors).push(collector);
                true
            }
            Err(e) => {
                self.logger
                    .error(&format!("rejected collector {address}:{port}: {e}"));
                false
            }
        }
    }

    pub fn collector_count(&self) -> usize {
        lock_collectors(&self.collectors).len()
    }
}

impl<E: RecordEncoder + 'static> Sink for BatchedProtocolExporter<E> {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn start(&self) -> Result<(), SinkError> {
        self.worker.start()
    }

    fn receive(&self, packet: Packet) {
        self.worker.submit(packet);
    }

    fn terminate(&self) -> Result<(), SinkError> {
        self.worker.terminate()
    }

    fn finish(&self, shutdown: &dyn ShutdownCheck) -> Result<(), SinkError> {
        self.worker.finish(shutdown)
    }

    fn stats(&self) -> StatsSnapshot {
        self.worker.counters().snapshot()
    }
}
