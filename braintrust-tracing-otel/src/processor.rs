//! Span processor stages that route OpenTelemetry spans into Braintrust.
//!
//! Three stages compose into the pipeline behind [`BraintrustSpanProcessor`]:
//!
//! ```ascii
//!   span start ──> ParentAttributeProcessor
//!   span end ────> FilterSpanProcessor ──keep──> BatchExportProcessor ──> SpanExporter
//!                        │ drop
//!                        └──> (discarded)
//! ```
//!
//! Each stage is also usable on its own as a [`SpanProcessor`].

use std::cmp::{max, min};
use std::env;
use std::fmt;
use std::mem;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use braintrust_tracing::{bt_debug, bt_warn};
use futures_executor::block_on;
use opentelemetry::trace::{Span as _, SpanId, TraceError, TraceResult};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::export::trace::{SpanData, SpanExporter};
use opentelemetry_sdk::trace::{Span, SpanProcessor};
use opentelemetry_sdk::Resource;

use crate::context::ResolvedParentDescriptor;
use crate::PARENT_DESCRIPTOR_KEY;

/// Telemetry-namespace prefixes the filter stage recognizes by default.
///
/// A non-root span survives the filter when its name or one of its attribute
/// keys starts with any of these.
pub const DEFAULT_KEEP_PREFIXES: [&str; 5] =
    ["gen_ai.", "braintrust.", "llm.", "ai.", "traceloop."];

/// Maximum queue size allowed in the batch stage.
pub(crate) const BRAINTRUST_BATCH_MAX_QUEUE_SIZE: &str = "BRAINTRUST_BATCH_MAX_QUEUE_SIZE";
/// Default maximum queue size.
pub(crate) const BRAINTRUST_BATCH_MAX_QUEUE_SIZE_DEFAULT: usize = 2_048;
/// Delay interval, in milliseconds, between two consecutive batch exports.
pub(crate) const BRAINTRUST_BATCH_SCHEDULE_DELAY: &str = "BRAINTRUST_BATCH_SCHEDULE_DELAY";
/// Default delay interval between two consecutive exports.
pub(crate) const BRAINTRUST_BATCH_SCHEDULE_DELAY_DEFAULT: u64 = 5_000;
/// Maximum number of spans sent in a single export call.
pub(crate) const BRAINTRUST_BATCH_MAX_EXPORT_BATCH_SIZE: &str =
    "BRAINTRUST_BATCH_MAX_EXPORT_BATCH_SIZE";
/// Default maximum export batch size.
pub(crate) const BRAINTRUST_BATCH_MAX_EXPORT_BATCH_SIZE_DEFAULT: usize = 512;

/// First stage: stamps the resolved parent descriptor onto every starting
/// span as the `braintrust.parent` attribute.
///
/// Resolution order is the descriptor key on the ambient context, then the
/// same key on the parent context the SDK hands to `on_start`. A descriptor
/// attribute already present on the span is never overwritten, and a span
/// with no resolvable parent simply starts unattributed.
#[derive(Debug, Default)]
pub struct ParentAttributeProcessor {
    _private: (),
}

impl ParentAttributeProcessor {
    /// Creates the stage.
    pub fn new() -> Self {
        ParentAttributeProcessor::default()
    }

    fn resolve(parent_cx: &Context) -> Option<String> {
        Context::map_current(|cx| cx.get::<ResolvedParentDescriptor>().map(|d| d.0.clone()))
            .or_else(|| parent_cx.get::<ResolvedParentDescriptor>().map(|d| d.0.clone()))
    }
}

impl SpanProcessor for ParentAttributeProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        let Some(descriptor) = Self::resolve(cx) else {
            return;
        };
        let already_attributed = span.exported_data().is_some_and(|data| {
            data.attributes
                .iter()
                .any(|kv| kv.key.as_str() == PARENT_DESCRIPTOR_KEY)
        });
        if !already_attributed {
            span.set_attribute(KeyValue::new(PARENT_DESCRIPTOR_KEY, descriptor));
        }
    }

    fn on_end(&self, _span: SpanData) {
        // Ignored
    }

    fn force_flush(&self) -> TraceResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> TraceResult<()> {
        Ok(())
    }
}

/// Keep/drop decision for one ended span, or `None` to defer to the prefix
/// rules.
pub type FilterPredicate = dyn Fn(&SpanData) -> Option<bool> + Send + Sync;

/// Second stage: forwards ended spans to `next` only when they are roots,
/// kept by the custom predicate, or recognizable AI telemetry.
///
/// Root spans always pass, even past the predicate, so a trace can never
/// lose its anchor. The decision for a given span is a pure function of the
/// span itself, so re-evaluating it is harmless.
pub struct FilterSpanProcessor<P> {
    next: P,
    predicate: Option<Box<FilterPredicate>>,
    keep_prefixes: Vec<String>,
}

impl<P> fmt::Debug for FilterSpanProcessor<P>
where
    P: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterSpanProcessor")
            .field("next", &self.next)
            .field("has_predicate", &self.predicate.is_some())
            .field("keep_prefixes", &self.keep_prefixes)
            .finish()
    }
}

impl<P: SpanProcessor> FilterSpanProcessor<P> {
    /// Wraps `next` behind the default prefix rules.
    pub fn new(next: P) -> Self {
        FilterSpanProcessor {
            next,
            predicate: None,
            keep_prefixes: DEFAULT_KEEP_PREFIXES
                .iter()
                .map(|prefix| (*prefix).to_owned())
                .collect(),
        }
    }

    /// Sets the custom keep/drop predicate, consulted for non-root spans
    /// before the prefix rules.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SpanData) -> Option<bool> + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Replaces the default prefix list.
    pub fn with_keep_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    fn keeps(&self, span: &SpanData) -> bool {
        if span.parent_span_id == SpanId::INVALID {
            return true;
        }
        if let Some(predicate) = &self.predicate {
            if let Some(decision) = predicate(span) {
                return decision;
            }
        }
        self.keep_prefixes
            .iter()
            .any(|prefix| span.name.starts_with(prefix.as_str()))
            || span.attributes.iter().any(|kv| {
                let key = kv.key.as_str();
                self.keep_prefixes
                    .iter()
                    .any(|prefix| key.starts_with(prefix.as_str()))
            })
    }
}

impl<P: SpanProcessor> SpanProcessor for FilterSpanProcessor<P> {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        self.next.on_start(span, cx);
    }

    fn on_end(&self, span: SpanData) {
        if self.keeps(&span) {
            self.next.on_end(span);
        } else {
            bt_debug!(name: "filter.span_dropped", span_name = span.name.as_ref());
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        self.next.force_flush()
    }

    fn shutdown(&self) -> TraceResult<()> {
        self.next.shutdown()
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.next.set_resource(resource);
    }
}

/// Messages exchanged between the caller threads and the export worker.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum BatchMessage {
    ExportSpan(SpanData),
    ForceFlush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
    SetResource(Arc<Resource>),
}

/// Third stage: queues ended spans and exports them in batches from a
/// dedicated worker thread.
///
/// The worker owns both the exporter and the pending buffer, so appends and
/// exports are serialized by construction. An export swaps the next batch
/// out of the buffer before the blocking call, and a transport failure is
/// reported to the caller while the spans not yet handed to the exporter
/// stay queued.
///
/// When the queue is full, `on_end` drops the span; the first drop emits a
/// warning and the total is reported at shutdown.
#[derive(Debug)]
pub struct BatchExportProcessor {
    message_sender: SyncSender<BatchMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    forceflush_timeout: Duration,
    shutdown_timeout: Duration,
    is_shutdown: AtomicBool,
    dropped_span_count: AtomicUsize,
}

impl BatchExportProcessor {
    /// Spawns the export worker and returns the processor.
    pub fn new<E>(mut exporter: E, config: BatchConfig) -> Self
    where
        E: SpanExporter + Send + 'static,
    {
        let (message_sender, message_receiver) = mpsc::sync_channel(config.max_queue_size);

        let handle = thread::Builder::new()
            .name("BraintrustBatchExport".to_string())
            .spawn(move || {
                let mut spans: Vec<SpanData> = Vec::with_capacity(config.max_export_batch_size);
                let mut last_export = Instant::now();

                loop {
                    let timeout = config.scheduled_delay.saturating_sub(last_export.elapsed());
                    match message_receiver.recv_timeout(timeout) {
                        Ok(BatchMessage::ExportSpan(span)) => {
                            spans.push(span);
                            if spans.len() >= config.max_export_batch_size {
                                if let Err(err) =
                                    drain(&mut exporter, &mut spans, config.max_export_batch_size)
                                {
                                    bt_warn!(
                                        name: "batch.export_failed",
                                        error = err.to_string()
                                    );
                                }
                                last_export = Instant::now();
                            }
                        }
                        Ok(BatchMessage::ForceFlush(sender)) => {
                            let result =
                                drain(&mut exporter, &mut spans, config.max_export_batch_size);
                            last_export = Instant::now();
                            let _ = sender.send(result);
                        }
                        Ok(BatchMessage::Shutdown(sender)) => {
                            let result =
                                drain(&mut exporter, &mut spans, config.max_export_batch_size);
                            exporter.shutdown();
                            let _ = sender.send(result);
                            break;
                        }
                        Ok(BatchMessage::SetResource(resource)) => {
                            exporter.set_resource(&resource);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if last_export.elapsed() >= config.scheduled_delay {
                                if let Err(err) =
                                    drain(&mut exporter, &mut spans, config.max_export_batch_size)
                                {
                                    bt_warn!(
                                        name: "batch.export_failed",
                                        error = err.to_string()
                                    );
                                }
                                last_export = Instant::now();
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            bt_debug!(name: "batch.channel_disconnected");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn the batch export thread");

        BatchExportProcessor {
            message_sender,
            handle: Mutex::new(Some(handle)),
            // TODO: expose these two through BatchConfigBuilder.
            forceflush_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            is_shutdown: AtomicBool::new(false),
            dropped_span_count: AtomicUsize::new(0),
        }
    }
}

/// Hands the queued spans to the exporter, at most `max_batch` per call.
fn drain<E: SpanExporter>(
    exporter: &mut E,
    spans: &mut Vec<SpanData>,
    max_batch: usize,
) -> TraceResult<()> {
    while !spans.is_empty() {
        let rest = spans.split_off(min(max_batch, spans.len()));
        let batch = mem::replace(spans, rest);
        block_on(exporter.export(batch))?;
    }
    Ok(())
}

impl SpanProcessor for BatchExportProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {
        // Ignored
    }

    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            bt_debug!(name: "batch.span_after_shutdown");
            return;
        }
        if self
            .message_sender
            .try_send(BatchMessage::ExportSpan(span))
            .is_err()
        {
            // Warn once per processor lifetime; the total goes out at
            // shutdown.
            if self.dropped_span_count.fetch_add(1, Ordering::Relaxed) == 0 {
                bt_warn!(
                    name: "batch.spans_dropping",
                    reason = "export queue is full"
                );
            }
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::Other("batch export stage is shut down".into()));
        }
        let (sender, receiver) = mpsc::sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::ForceFlush(sender))
            .map_err(|err| TraceError::Other(err.to_string().into()))?;
        receiver
            .recv_timeout(self.forceflush_timeout)
            .map_err(|err| TraceError::Other(err.to_string().into()))?
    }

    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::Other(
                "batch export stage is already shut down".into(),
            ));
        }
        let dropped = self.dropped_span_count.load(Ordering::Relaxed);
        if dropped > 0 {
            bt_warn!(name: "batch.spans_dropped", count = dropped);
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::Shutdown(sender))
            .map_err(|err| TraceError::Other(err.to_string().into()))?;
        let result = receiver
            .recv_timeout(self.shutdown_timeout)
            .map_err(|err| TraceError::Other(err.to_string().into()))?;

        let handle = self
            .handle
            .lock()
            .map_err(|_| TraceError::Other("export worker handle is poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| TraceError::Other("export worker panicked".into()))?;
        }
        result
    }

    fn set_resource(&mut self, resource: &Resource) {
        let resource = Arc::new(resource.clone());
        let _ = self
            .message_sender
            .try_send(BatchMessage::SetResource(resource));
    }
}

/// Batch stage configuration. Assembled by [`BatchConfigBuilder`].
#[derive(Debug)]
pub struct BatchConfig {
    pub(crate) max_queue_size: usize,
    pub(crate) scheduled_delay: Duration,
    pub(crate) max_export_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// A builder for [`BatchConfig`].
///
/// Initial values come from the `BRAINTRUST_BATCH_MAX_QUEUE_SIZE`,
/// `BRAINTRUST_BATCH_SCHEDULE_DELAY` (milliseconds) and
/// `BRAINTRUST_BATCH_MAX_EXPORT_BATCH_SIZE` environment variables when set;
/// explicit builder calls win over the environment.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
}

impl Default for BatchConfigBuilder {
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: BRAINTRUST_BATCH_MAX_QUEUE_SIZE_DEFAULT,
            scheduled_delay: Duration::from_millis(BRAINTRUST_BATCH_SCHEDULE_DELAY_DEFAULT),
            max_export_batch_size: BRAINTRUST_BATCH_MAX_EXPORT_BATCH_SIZE_DEFAULT,
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Sets the maximum number of spans kept in the queue before dropping.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Sets the delay interval between two consecutive exports.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Sets the maximum number of spans delivered in a single export call.
    ///
    /// Clamped between 1 and the queue size at build time.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> BatchConfig {
        // A zero batch size would keep `drain` from making progress.
        let max_export_batch_size = max(1, min(self.max_export_batch_size, self.max_queue_size));
        BatchConfig {
            max_queue_size: self.max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_batch_size,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = env::var(BRAINTRUST_BATCH_MAX_QUEUE_SIZE)
            .ok()
            .and_then(|queue_size| usize::from_str(&queue_size).ok())
        {
            self.max_queue_size = max_queue_size;
        }

        if let Some(scheduled_delay) = env::var(BRAINTRUST_BATCH_SCHEDULE_DELAY)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.scheduled_delay = Duration::from_millis(scheduled_delay);
        }

        if let Some(max_export_batch_size) = env::var(BRAINTRUST_BATCH_MAX_EXPORT_BATCH_SIZE)
            .ok()
            .and_then(|batch_size| usize::from_str(&batch_size).ok())
        {
            self.max_export_batch_size = max_export_batch_size;
        }

        self
    }
}

/// The composed Braintrust pipeline behind a single [`SpanProcessor`].
///
/// Every starting span runs through parent attribution; ended spans pass
/// the filter and, when kept, the batch export stage.
#[derive(Debug)]
pub struct BraintrustSpanProcessor {
    parent: ParentAttributeProcessor,
    pipeline: FilterSpanProcessor<BatchExportProcessor>,
}

impl BraintrustSpanProcessor {
    /// Starts configuring a pipeline around `exporter`.
    pub fn builder<E>(exporter: E) -> BraintrustSpanProcessorBuilder<E>
    where
        E: SpanExporter + Send + 'static,
    {
        BraintrustSpanProcessorBuilder {
            exporter,
            predicate: None,
            keep_prefixes: None,
            batch_config: None,
        }
    }
}

impl SpanProcessor for BraintrustSpanProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        self.parent.on_start(span, cx);
    }

    fn on_end(&self, span: SpanData) {
        self.pipeline.on_end(span);
    }

    fn force_flush(&self) -> TraceResult<()> {
        self.pipeline.force_flush()
    }

    fn shutdown(&self) -> TraceResult<()> {
        self.pipeline.shutdown()
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.pipeline.set_resource(resource);
    }
}

/// A builder for [`BraintrustSpanProcessor`].
pub struct BraintrustSpanProcessorBuilder<E> {
    exporter: E,
    predicate: Option<Box<FilterPredicate>>,
    keep_prefixes: Option<Vec<String>>,
    batch_config: Option<BatchConfig>,
}

impl<E> fmt::Debug for BraintrustSpanProcessorBuilder<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BraintrustSpanProcessorBuilder")
            .field("exporter", &self.exporter)
            .field("has_predicate", &self.predicate.is_some())
            .field("keep_prefixes", &self.keep_prefixes)
            .field("batch_config", &self.batch_config)
            .finish()
    }
}

impl<E> BraintrustSpanProcessorBuilder<E>
where
    E: SpanExporter + Send + 'static,
{
    /// Sets the custom keep/drop predicate of the filter stage.
    pub fn with_filter_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SpanData) -> Option<bool> + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Replaces the default prefix list of the filter stage.
    pub fn with_keep_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_prefixes = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the batch stage configuration.
    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = Some(config);
        self
    }

    /// Builds the pipeline, spawning the export worker.
    pub fn build(self) -> BraintrustSpanProcessor {
        let batch =
            BatchExportProcessor::new(self.exporter, self.batch_config.unwrap_or_default());
        let mut filter = FilterSpanProcessor::new(batch);
        if let Some(predicate) = self.predicate {
            filter.predicate = Some(predicate);
        }
        if let Some(prefixes) = self.keep_prefixes {
            filter.keep_prefixes = prefixes;
        }
        BraintrustSpanProcessor {
            parent: ParentAttributeProcessor::new(),
            pipeline: filter,
        }
    }
}
