//! Context management over the OpenTelemetry ambient [`Context`].
//!
//! [`OtelContextManager`] lets the native tracer and an OpenTelemetry SDK
//! share one notion of "the active span". Attaching a native span installs
//! a remote-style synthetic span context, so foreign spans started inside
//! the scope become its children; the native span handle itself rides along
//! under a private typed key, so native lookups recover the original object
//! rather than the synthetic wrapper.

use std::sync::Arc;

use braintrust_tracing::bt_debug;
use braintrust_tracing::context::{ActiveSpanGuard, ContextManager, ParentSpanIds};
use braintrust_tracing::tracer::Span;
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;

// Context values are stored by type, so each private key is a newtype.
#[derive(Clone, Debug)]
pub(crate) struct ActiveNativeSpan(pub(crate) Arc<Span>);

#[derive(Clone, Debug)]
pub(crate) struct ResolvedParentDescriptor(pub(crate) String);

/// Context manager that delegates scope tracking to the OpenTelemetry
/// [`Context`].
///
/// Only spans whose ids fit the W3C id space can cross into the foreign
/// context; attaching a native-UUID span degrades to a no-op guard after a
/// debug diagnostic, per the [`ContextManager`] contract.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use braintrust_tracing::identity::{OwnerKind, OwnerRef};
/// use braintrust_tracing::idgen::IdentitySpace;
/// use braintrust_tracing::tracer::Tracer;
/// use braintrust_tracing_otel::OtelContextManager;
///
/// let tracer = Tracer::builder(OwnerKind::ProjectLogs, OwnerRef::Id("p1".into()))
///     .with_identity_space(IdentitySpace::Interop)
///     .with_context_manager(Arc::new(OtelContextManager::new()))
///     .build();
///
/// let root = Arc::new(tracer.start_span("request"));
/// let _guard = tracer.context_manager().attach(root.clone());
/// // OpenTelemetry spans started here join the native trace, and native
/// // spans keep parenting under `root`.
/// let child = tracer.start_span("step");
/// assert_eq!(child.parents(), [root.span_id()]);
/// ```
#[derive(Debug, Default)]
pub struct OtelContextManager {
    _private: (),
}

impl OtelContextManager {
    /// Creates a manager over the OpenTelemetry ambient context.
    pub fn new() -> Self {
        OtelContextManager::default()
    }
}

fn ids_match(span_context: &SpanContext, span: &Span) -> bool {
    format!("{:032x}", span_context.trace_id()) == span.root_span_id()
        && format!("{:016x}", span_context.span_id()) == span.span_id()
}

// `from_hex` zero-extends short input and accepts upper case; only ids whose
// fixed-width rendering is exactly the stored string may cross.
fn w3c_trace_id(value: &str) -> Option<TraceId> {
    let trace_id = TraceId::from_hex(value).ok()?;
    (format!("{:032x}", trace_id) == value).then_some(trace_id)
}

fn w3c_span_id(value: &str) -> Option<SpanId> {
    let span_id = SpanId::from_hex(value).ok()?;
    (format!("{:016x}", span_id) == value).then_some(span_id)
}

impl ContextManager for OtelContextManager {
    fn attach(&self, span: Arc<Span>) -> ActiveSpanGuard {
        let ids = w3c_trace_id(span.root_span_id()).zip(w3c_span_id(span.span_id()));
        let (trace_id, span_id) = match ids {
            Some(ids) => ids,
            None => {
                bt_debug!(
                    name: "otel_context.attach_degraded",
                    reason = "span ids do not fit the w3c id space"
                );
                return ActiveSpanGuard::noop();
            }
        };
        let span_context = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let mut cx = Context::current()
            .with_remote_span_context(span_context)
            .with_value(ActiveNativeSpan(Arc::clone(&span)));
        match span.parent_descriptor() {
            Ok(descriptor) => {
                cx = cx.with_value(ResolvedParentDescriptor(descriptor.to_string()));
            }
            Err(_) => {
                bt_debug!(
                    name: "otel_context.descriptor_skipped",
                    reason = "owner has no descriptor rendering"
                );
            }
        }
        ActiveSpanGuard::from_scope(cx.attach())
    }

    fn current_span(&self) -> Option<Arc<Span>> {
        Context::map_current(|cx| {
            cx.get::<ActiveNativeSpan>()
                .map(|active| Arc::clone(&active.0))
        })
    }

    fn parent_span_ids(&self) -> Option<ParentSpanIds> {
        Context::map_current(|cx| {
            let span = cx.span();
            let span_context = span.span_context();
            if let Some(active) = cx.get::<ActiveNativeSpan>() {
                // The active foreign span is our own synthetic wrapper; hand
                // back the native ids rather than double-wrapping them.
                if ids_match(span_context, &active.0) {
                    return Some(ParentSpanIds {
                        root_span_id: active.0.root_span_id().to_owned(),
                        parents: vec![active.0.span_id().to_owned()],
                    });
                }
            }
            if span_context.is_valid() {
                Some(ParentSpanIds {
                    root_span_id: format!("{:032x}", span_context.trace_id()),
                    parents: vec![format!("{:016x}", span_context.span_id())],
                })
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braintrust_tracing::identity::{OwnerKind, OwnerRef};
    use braintrust_tracing::idgen::{IdGenerator, IdentitySpace};
    use braintrust_tracing::tracer::Tracer;

    fn interop_tracer() -> Tracer {
        Tracer::builder(OwnerKind::ProjectLogs, OwnerRef::Id("proj-1".into()))
            .with_identity_space(IdentitySpace::Interop)
            .with_context_manager(Arc::new(OtelContextManager::new()))
            .build()
    }

    /// Mints hex ids narrower than the W3C widths.
    #[derive(Debug, Default)]
    struct ShortHexIdGenerator {
        next: std::sync::atomic::AtomicU64,
    }

    impl IdGenerator for ShortHexIdGenerator {
        fn new_span_id(&self) -> String {
            format!(
                "{:08x}",
                self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            )
        }

        fn new_trace_id(&self) -> String {
            self.new_span_id()
        }

        fn root_reuses_span_id(&self) -> bool {
            false
        }
    }

    #[test]
    fn attach_installs_a_synthetic_foreign_span() {
        let tracer = interop_tracer();
        let manager = OtelContextManager::new();
        let span = Arc::new(tracer.start_span("request"));

        let guard = manager.attach(Arc::clone(&span));
        assert!(guard.is_active());

        Context::map_current(|cx| {
            let span_context = cx.span().span_context().clone();
            assert!(span_context.is_valid());
            assert!(span_context.is_remote());
            assert_eq!(
                format!("{:032x}", span_context.trace_id()),
                span.root_span_id()
            );
            assert_eq!(format!("{:016x}", span_context.span_id()), span.span_id());
            assert_eq!(
                cx.get::<ResolvedParentDescriptor>().map(|d| d.0.as_str()),
                Some("project_id:proj-1")
            );
        });

        let ids = manager.parent_span_ids().unwrap();
        assert_eq!(ids.root_span_id, span.root_span_id());
        assert_eq!(ids.parents, [span.span_id().to_owned()]);
        assert_eq!(
            manager.current_span().map(|s| s.row_id().to_owned()),
            Some(span.row_id().to_owned())
        );

        drop(guard);
        assert!(manager.current_span().is_none());
        assert!(manager.parent_span_ids().is_none());
    }

    #[test]
    fn native_uuid_ids_degrade_to_a_noop_guard() {
        let tracer = Tracer::builder(OwnerKind::Experiment, OwnerRef::Id("exp-1".into()))
            .with_context_manager(Arc::new(OtelContextManager::new()))
            .build();
        let manager = OtelContextManager::new();
        let span = Arc::new(tracer.start_span("eval"));

        let guard = manager.attach(span);
        assert!(!guard.is_active());
        assert!(manager.current_span().is_none());
    }

    #[test]
    fn short_hex_ids_degrade_to_a_noop_guard() {
        let tracer = Tracer::builder(OwnerKind::Experiment, OwnerRef::Id("exp-1".into()))
            .with_id_generator(Arc::new(ShortHexIdGenerator::default()))
            .with_context_manager(Arc::new(OtelContextManager::new()))
            .build();
        let manager = OtelContextManager::new();
        let span = Arc::new(tracer.start_span("eval"));
        assert_eq!(span.span_id().len(), 8);

        let guard = manager.attach(span);
        assert!(!guard.is_active());
        assert!(manager.current_span().is_none());
        assert!(manager.parent_span_ids().is_none());
    }

    #[test]
    fn only_exact_width_lower_case_hex_crosses() {
        assert!(w3c_trace_id("4bf92f3577b34da6a3ce929d0e0e4736").is_some());
        assert!(w3c_span_id("00f067aa0ba902b7").is_some());

        assert!(w3c_trace_id("4bf92f35").is_none());
        assert!(w3c_trace_id("4BF92F3577B34DA6A3CE929D0E0E4736").is_none());
        assert!(w3c_span_id("0ba902b7").is_none());
        assert!(w3c_span_id("00F067AA0BA902B7").is_none());
    }

    #[test]
    fn foreign_span_supplies_parent_ids() {
        let manager = OtelContextManager::new();
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let _guard = Context::current()
            .with_remote_span_context(span_context)
            .attach();

        let ids = manager.parent_span_ids().unwrap();
        assert_eq!(ids.root_span_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ids.parents, ["00f067aa0ba902b7".to_owned()]);
        assert!(manager.current_span().is_none());
    }

    #[test]
    fn newer_foreign_span_wins_over_the_stored_native_handle() {
        let tracer = interop_tracer();
        let manager = OtelContextManager::new();
        let native = Arc::new(tracer.start_span("outer"));
        let _outer = manager.attach(Arc::clone(&native));

        // A foreign layer pushes its own span on top of ours.
        let foreign = SpanContext::new(
            TraceId::from_hex("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap(),
            SpanId::from_hex("bbbbbbbbbbbbbbbb").unwrap(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );
        let _inner = Context::current().with_remote_span_context(foreign).attach();

        let ids = manager.parent_span_ids().unwrap();
        assert_eq!(ids.root_span_id, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(ids.parents, ["bbbbbbbbbbbbbbbb".to_owned()]);
        // The native handle stays reachable for native lookups.
        assert!(manager.current_span().is_some());
    }

    #[test]
    fn empty_context_has_no_parent() {
        let manager = OtelContextManager::new();
        assert!(manager.parent_span_ids().is_none());
        assert!(manager.current_span().is_none());
    }
}
