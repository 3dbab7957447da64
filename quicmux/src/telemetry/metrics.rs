//! Fire-and-forget metrics.
//!
//! Shard threads push [`MetricsEvent`]s into a global unbounded crossbeam
//! channel. A collector task on the tokio runtime drains it and updates the
//! OpenTelemetry instruments, which a periodic reader exports over OTLP.
//! Before [`start_metrics_task`] runs (and in tests) recording is a no-op.

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::OnceCell;
use opentelemetry::{
    metrics::{Counter, Histogram, Meter, MeterProvider, ObservableGauge},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    runtime, Resource,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::config::TelemetryConfig;

static METRICS_SENDER: OnceCell<Sender<MetricsEvent>> = OnceCell::new();

/// Events drained per batch before the collector yields.
const BATCH_SIZE: usize = 256;

/// Measures a span of work for a duration metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

/// Why an inbound datagram never reached a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Connection id could not be parsed.
    Malformed,
    /// The owning shard's inbound channel was full.
    ForwardQueueFull,
    /// The engine rejected the datagram.
    Rejected,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::ForwardQueueFull => "forward_queue_full",
            DropReason::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone)]
pub enum MetricsEvent {
    // ---- network ----
    PacketReceived { bytes: usize },
    PacketSent { bytes: usize },
    PacketDropped { reason: DropReason },
    /// Datagram handed to the shard that owns its connection id.
    PacketForwarded,
    NetworkReceiveError,
    NetworkSendError,
    /// A write was refused because the writer queue was full.
    WriteQueueFull,
    BufferPoolUtilization { idle: usize, capacity: usize },
    ShardStarted,
    ShardStopped,

    // ---- scheduler ----
    /// One `do_tasks` batch fired this many alarms.
    AlarmsFired { count: usize },
    /// A popped alarm was not yet due and went back on the heap.
    AlarmRearmed,

    // ---- sessions and streams ----
    SessionCreated,
    SessionClosed { duration_ms: u64 },
    StreamOpened,
    StreamClosed { duration_ms: u64 },

    // ---- proofs ----
    ProofSigned { duration_us: u64 },
    ProofFailed,
}

/// Owns the collector task.
pub struct MetricsHandle {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsHandle {
    pub fn disabled() -> Self {
        Self {
            task_handle: None,
            shutdown_tx: None,
        }
    }

    /// Stop the collector, flushing what is queued. Gives up after 5 seconds.
    pub async fn shutdown(self) {
        if let Some(tx) = self.shutdown_tx {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Err(e)) => tracing::error!(error = ?e, "Metrics task panicked during shutdown"),
                Ok(Ok(())) => {}
                Err(_) => tracing::error!("Metrics task shutdown timed out after 5 seconds"),
            }
        }
    }
}

fn gauge(meter: &Meter, name: &'static str, description: &'static str) -> (Arc<AtomicU64>, ObservableGauge<u64>) {
    let value = Arc::new(AtomicU64::new(0));
    let observed = Arc::clone(&value);
    let instrument = meter
        .u64_observable_gauge(name)
        .with_description(description)
        .with_callback(move |observer| observer.observe(observed.load(Ordering::Relaxed), &[]))
        .build();
    (value, instrument)
}

struct MetricsCollector {
    packets_received: Counter<u64>,
    packets_sent: Counter<u64>,
    bytes_received: Counter<u64>,
    bytes_sent: Counter<u64>,
    packets_dropped: Counter<u64>,
    packets_forwarded: Counter<u64>,
    network_errors: Counter<u64>,
    write_queue_full: Counter<u64>,

    buffer_pool_idle: Arc<AtomicU64>,
    buffer_pool_capacity: Arc<AtomicU64>,
    active_shards: Arc<AtomicU64>,

    alarms_fired: Counter<u64>,
    alarm_batch_size: Histogram<u64>,
    alarms_rearmed: Counter<u64>,

    sessions_total: Counter<u64>,
    sessions_active: Arc<AtomicU64>,
    session_duration: Histogram<u64>,
    streams_total: Counter<u64>,
    streams_active: Arc<AtomicU64>,
    stream_duration: Histogram<u64>,

    proofs_signed: Counter<u64>,
    proof_duration: Histogram<u64>,
    proof_failures: Counter<u64>,

    _gauges: Vec<ObservableGauge<u64>>,
}

impl MetricsCollector {
    fn new(meter: &Meter) -> Self {
        let counter = |name: &'static str, description: &'static str| {
            meter.u64_counter(name).with_description(description).build()
        };
        let histogram = |name: &'static str, description: &'static str| {
            meter.u64_histogram(name).with_description(description).build()
        };

        let (buffer_pool_idle, idle_gauge) =
            gauge(meter, "buffer_pool.idle", "Buffers sitting in the shard pool");
        let (buffer_pool_capacity, capacity_gauge) =
            gauge(meter, "buffer_pool.capacity", "Configured shard pool capacity");
        let (active_shards, shards_gauge) = gauge(meter, "shards.active", "Running shard loops");
        let (sessions_active, sessions_gauge) = gauge(meter, "sessions.active", "Live sessions");
        let (streams_active, streams_gauge) = gauge(meter, "streams.active", "Live streams");

        Self {
            packets_received: counter("network.packets.received", "UDP datagrams received"),
            packets_sent: counter("network.packets.sent", "UDP datagrams sent"),
            bytes_received: counter("network.bytes.received", "Bytes received from the network"),
            bytes_sent: counter("network.bytes.sent", "Bytes sent to the network"),
            packets_dropped: counter("network.packets.dropped", "Datagrams dropped before dispatch"),
            packets_forwarded: counter("network.packets.forwarded", "Datagrams forwarded across shards"),
            network_errors: counter("network.errors", "Socket errors"),
            write_queue_full: counter("writer.queue_full", "Writes refused by a full writer queue"),
            buffer_pool_idle,
            buffer_pool_capacity,
            active_shards,
            alarms_fired: counter("scheduler.alarms.fired", "Alarms fired"),
            alarm_batch_size: histogram("scheduler.batch.size", "Alarms fired per timer wake"),
            alarms_rearmed: counter("scheduler.alarms.rearmed", "Alarms re-armed after a premature wake"),
            sessions_total: counter("sessions.total", "Sessions created"),
            sessions_active,
            session_duration: histogram("session.duration", "Session lifetime in milliseconds"),
            streams_total: counter("streams.total", "Streams opened"),
            streams_active,
            stream_duration: histogram("stream.duration", "Stream lifetime in milliseconds"),
            proofs_signed: counter("proof.signed", "Handshake proofs signed"),
            proof_duration: histogram("proof.duration", "Proof signing time in microseconds"),
            proof_failures: counter("proof.failures", "Proof requests that failed"),
            _gauges: vec![
                idle_gauge,
                capacity_gauge,
                shards_gauge,
                sessions_gauge,
                streams_gauge,
            ],
        }
    }

    fn process_event(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::PacketReceived { bytes } => {
                self.packets_received.add(1, &[]);
                self.bytes_received.add(bytes as u64, &[]);
            }
            MetricsEvent::PacketSent { bytes } => {
                self.packets_sent.add(1, &[]);
                self.bytes_sent.add(bytes as u64, &[]);
            }
            MetricsEvent::PacketDropped { reason } => {
                self.packets_dropped
                    .add(1, &[KeyValue::new("reason", reason.as_str())]);
            }
            MetricsEvent::PacketForwarded => self.packets_forwarded.add(1, &[]),
            MetricsEvent::NetworkReceiveError => {
                self.network_errors.add(1, &[KeyValue::new("type", "receive")]);
            }
            MetricsEvent::NetworkSendError => {
                self.network_errors.add(1, &[KeyValue::new("type", "send")]);
            }
            MetricsEvent::WriteQueueFull => self.write_queue_full.add(1, &[]),
            MetricsEvent::BufferPoolUtilization { idle, capacity } => {
                self.buffer_pool_idle.store(idle as u64, Ordering::Relaxed);
                self.buffer_pool_capacity
                    .store(capacity as u64, Ordering::Relaxed);
            }
            MetricsEvent::ShardStarted => {
                self.active_shards.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::ShardStopped => {
                self.active_shards.fetch_sub(1, Ordering::Relaxed);
            }
            MetricsEvent::AlarmsFired { count } => {
                self.alarms_fired.add(count as u64, &[]);
                self.alarm_batch_size.record(count as u64, &[]);
            }
            MetricsEvent::AlarmRearmed => self.alarms_rearmed.add(1, &[]),
            MetricsEvent::SessionCreated => {
                self.sessions_total.add(1, &[]);
                self.sessions_active.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::SessionClosed { duration_ms } => {
                self.sessions_active.fetch_sub(1, Ordering::Relaxed);
                self.session_duration.record(duration_ms, &[]);
            }
            MetricsEvent::StreamOpened => {
                self.streams_total.add(1, &[]);
                self.streams_active.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::StreamClosed { duration_ms } => {
                self.streams_active.fetch_sub(1, Ordering::Relaxed);
                self.stream_duration.record(duration_ms, &[]);
            }
            MetricsEvent::ProofSigned { duration_us } => {
                self.proofs_signed.add(1, &[]);
                self.proof_duration.record(duration_us, &[]);
            }
            MetricsEvent::ProofFailed => self.proof_failures.add(1, &[]),
        }
    }

    fn drain(&self, rx: &Receiver<MetricsEvent>, limit: usize) -> usize {
        let mut processed = 0;
        while processed < limit {
            match rx.try_recv() {
                Ok(event) => {
                    self.process_event(event);
                    processed += 1;
                }
                Err(_) => break,
            }
        }
        processed
    }
}

/// Record a metrics event. Never blocks; a no-op until the collector runs.
#[inline]
pub fn record_metric(event: MetricsEvent) {
    if let Some(sender) = METRICS_SENDER.get() {
        let _ = sender.send(event);
    }
}

/// Install the global sender and spawn the collector on `runtime_handle`.
pub async fn start_metrics_task(
    config: &TelemetryConfig,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<MetricsHandle> {
    let (tx, rx) = crossbeam_channel::unbounded::<MetricsEvent>();
    METRICS_SENDER
        .set(tx)
        .map_err(|_| anyhow::anyhow!("metrics sender already initialized"))?;

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(Duration::from_secs(config.export_interval_secs))
        .with_timeout(Duration::from_secs(5))
        .build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]))
        .build();

    let collector = MetricsCollector::new(&provider.meter("quicmux"));
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

    let task_handle = runtime_handle.spawn(async move {
        tracing::info!("Metrics collection task started");
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = async {
                    if collector.drain(&rx, BATCH_SIZE) == 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                } => {}
            }
        }

        collector.drain(&rx, usize::MAX);
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = ?e, "Failed to shut down metrics provider");
        }
        tracing::info!("Metrics task stopped");
    });

    Ok(MetricsHandle {
        task_handle: Some(task_handle),
        shutdown_tx: Some(shutdown_tx),
    })
}
