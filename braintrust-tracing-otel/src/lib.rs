//! OpenTelemetry interop for the Braintrust tracing client.
//!
//! [`braintrust_tracing`] mints span identities and manages native scopes;
//! this crate connects that core to an OpenTelemetry SDK in three places:
//!
//! * **Context bridging**: [`OtelContextManager`] stores the active native
//!   span in the OpenTelemetry [`Context`], so native and foreign spans
//!   interleave into one trace tree.
//! * **Span processing**: [`BraintrustSpanProcessor`] composes parent
//!   attribution, AI-telemetry filtering, and batched export into a single
//!   [`SpanProcessor`] to hang off a tracer provider.
//! * **Header propagation**: [`propagation`] moves parent identities across
//!   process boundaries over W3C `traceparent` and `baggage` headers.
//!
//! # Getting started
//!
//! Attach the pipeline to a provider and spans flow to the exporter with
//! their Braintrust parent attached:
//!
//! ```
//! use braintrust_tracing_otel::BraintrustSpanProcessor;
//! use opentelemetry::trace::{Tracer as _, TracerProvider as _};
//! use opentelemetry_sdk::testing::trace::InMemorySpanExporterBuilder;
//! use opentelemetry_sdk::trace::TracerProvider;
//!
//! let exporter = InMemorySpanExporterBuilder::new().build();
//! let provider = TracerProvider::builder()
//!     .with_span_processor(BraintrustSpanProcessor::builder(exporter.clone()).build())
//!     .build();
//!
//! let tracer = provider.tracer("app");
//! tracer.in_span("gen_ai.chat_completion", |_cx| {
//!     // call the model
//! });
//!
//! for result in provider.force_flush() {
//!     result.unwrap();
//! }
//! assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
//! ```
//!
//! # Crate Feature Flags
//!
//! The following feature flags can used to control the telemetry this crate
//! emits about itself:
//!
//! * `internal-logs`: Emit internal logs, for this crate and the underlying
//!   OpenTelemetry crates, via the `tracing` crate. Enabled by default.
//!
//! # Supported Rust Versions
//!
//! This crate is built against the latest stable release. The minimum
//! supported version is 1.75. The current version is not guaranteed to
//! build on Rust versions earlier than the minimum supported version.
//!
//! [`Context`]: opentelemetry::Context
//! [`SpanProcessor`]: opentelemetry_sdk::trace::SpanProcessor
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]
#![cfg_attr(test, deny(warnings))]

pub mod context;
pub mod processor;
pub mod propagation;

pub use context::OtelContextManager;
pub use processor::{
    BatchConfig, BatchConfigBuilder, BatchExportProcessor, BraintrustSpanProcessor,
    BraintrustSpanProcessorBuilder, FilterSpanProcessor, ParentAttributeProcessor,
};

/// Span attribute and baggage key carrying the parent descriptor.
pub const PARENT_DESCRIPTOR_KEY: &str = "braintrust.parent";
