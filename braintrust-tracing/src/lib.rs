//! Span identity and creation for the [Braintrust] tracing client.
//!
//! This crate is the tracing client's core: it defines what a span *is* (an
//! owner scope plus trace coordinates), how that identity travels between
//! processes, and how new spans decide their parentage. It has no opinion
//! about exporting rows or about other tracing systems; interop layers such
//! as `braintrust-tracing-otel` build on the seams this crate exposes.
//!
//! Here's a breakdown of its components:
//!
//! - **[`identity`]:** The [`SpanIdentity`] data model, the versioned
//!   portable encoding it travels between processes as, and the compact
//!   parent descriptors used by propagation headers.
//! - **[`idgen`]:** Pluggable id-minting strategies, covering the native
//!   UUID id space and the fixed-width hex space used when interoperating
//!   with W3C trace context.
//! - **[`context`]:** The [`ContextManager`] seam that tracks the active
//!   span, with a thread-local native implementation.
//! - **[`tracer`]:** The [`Tracer`] that mints spans, resolving each span's
//!   parent from an explicit handoff string, the active scope, or neither.
//!
//! [Braintrust]: https://www.braintrust.dev
//! [`SpanIdentity`]: identity::SpanIdentity
//! [`ContextManager`]: context::ContextManager
//! [`Tracer`]: tracer::Tracer
//!
//! # Getting started
//!
//! ```
//! use std::sync::Arc;
//!
//! use braintrust_tracing::context::with_active_span;
//! use braintrust_tracing::identity::{OwnerKind, OwnerRef};
//! use braintrust_tracing::tracer::Tracer;
//!
//! let tracer = Tracer::builder(OwnerKind::Experiment, OwnerRef::Id("exp-1".into())).build();
//!
//! let root = Arc::new(tracer.start_span("eval"));
//! let manager = tracer.context_manager().clone();
//! let child = with_active_span(manager.as_ref(), root.clone(), || tracer.start_span("step"));
//! assert_eq!(child.parents(), [root.span_id()]);
//!
//! // Cross a process boundary: export on one side, keep building on the other.
//! let handoff = child.export();
//! let remote = tracer.start_span_with_parent("remote step", &handoff).unwrap();
//! assert_eq!(remote.root_span_id(), root.span_id());
//! ```
//!
//! # Crate Feature Flags
//!
//! The following feature flags are available:
//!
//! * `internal-logs`: Emits the crate's self-diagnostics as [`tracing`]
//!   events. Enabled by default.
//! * `testing`: Exposes deterministic helpers such as
//!   `idgen::SequenceIdGenerator` for use in downstream test suites.
//!
//! [`tracing`]: https://crates.io/crates/tracing
//!
//! # Supported Rust Versions
//!
//! This crate is built against the latest stable release. The minimum
//! supported version is 1.75. The current version is not guaranteed to build
//! on Rust versions earlier than the minimum supported version.
//!
//! The current stable Rust compiler and the three most recent minor versions
//! before it will always be supported. For example, if the current stable
//! compiler version is 1.79, the minimum supported version will not be
//! increased past 1.76, three minor versions prior. Increasing the minimum
//! supported compiler version is not considered a semver breaking change as
//! long as doing so complies with this policy.
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

mod error;

pub use error::{Error, Result};

pub mod identity;

pub mod idgen;

mod internal_logging;

pub mod tracer;

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
