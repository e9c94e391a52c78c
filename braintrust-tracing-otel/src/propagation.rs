//! Cross-process propagation of Braintrust parent identities over W3C
//! headers.
//!
//! Outbound, [`context_from_identity`] turns a fully positioned
//! [`SpanIdentity`] into an OpenTelemetry [`Context`] carrying a remote span
//! context plus the parent descriptor as `braintrust.parent` baggage, and
//! [`inject_distributed_headers`] writes that context into a carrier as
//! `traceparent`/`tracestate`/`baggage`. Inbound, [`parent_from_headers`]
//! reverses the trip and hands back an encoded parent string ready for
//! [`Tracer::start_span_with_parent`].
//!
//! [`Tracer::start_span_with_parent`]: braintrust_tracing::tracer::Tracer::start_span_with_parent

use braintrust_tracing::bt_warn;
use braintrust_tracing::identity::{ParentDescriptor, SpanIdentity, TracePosition};
use braintrust_tracing::{Error, Result};
use opentelemetry::baggage::BaggageExt;
use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use uuid::Uuid;

use crate::PARENT_DESCRIPTOR_KEY;

/// Row id recorded for parents imported from foreign headers.
///
/// Rows are minted by the native tracer; a parent reconstructed from
/// `traceparent` has no row of its own, so this sentinel marks the position
/// as foreign-rooted.
pub const FOREIGN_ROW_ID: &str = "otel";

/// The propagator stack used by both directions: W3C trace context plus
/// W3C baggage.
pub fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

fn trace_id_from_root(root_span_id: &str) -> Result<TraceId> {
    if root_span_id.len() == 32 {
        if let Ok(trace_id) = TraceId::from_hex(root_span_id) {
            return Ok(trace_id);
        }
    } else if let Ok(uuid) = Uuid::parse_str(root_span_id) {
        // Only the canonical hyphenated spelling crosses; it strips to the
        // same 16 bytes the compact wire form carries.
        if uuid.hyphenated().to_string() == root_span_id {
            return Ok(TraceId::from_bytes(*uuid.as_bytes()));
        }
    }
    Err(Error::InvalidEncoding)
}

fn span_id_from_hex(span_id: &str) -> Result<SpanId> {
    // from_hex is lenient about input length, so gate on the exact shape.
    if span_id.len() == 16 {
        if let Ok(span_id) = SpanId::from_hex(span_id) {
            return Ok(span_id);
        }
    }
    Err(Error::InvalidEncoding)
}

/// Builds an OpenTelemetry [`Context`] whose active span and baggage carry
/// `identity` across a process boundary.
///
/// The identity must be pinned to a full trace position
/// ([`Error::MissingRequiredField`] otherwise), its span id must be 16-hex
/// and its root span id 32-hex or a canonical UUID
/// ([`Error::InvalidEncoding`] otherwise, since such ids cannot cross into
/// the W3C id space), and its owner must be descriptor-expressible
/// ([`Error::MissingRequiredField`]).
pub fn context_from_identity(identity: &SpanIdentity) -> Result<Context> {
    let position = identity
        .position()
        .ok_or(Error::MissingRequiredField("trace position"))?;
    let trace_id = trace_id_from_root(position.root_span_id())?;
    let span_id = span_id_from_hex(position.span_id())?;
    let descriptor = identity.parent_descriptor()?;

    let span_context = SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    Ok(Context::new()
        .with_remote_span_context(span_context)
        .with_baggage([KeyValue::new(PARENT_DESCRIPTOR_KEY, descriptor.to_string())]))
}

/// Decodes an exported identity string and delegates to
/// [`context_from_identity`].
pub fn context_from_export(encoded: &str) -> Result<Context> {
    context_from_identity(&SpanIdentity::decode(encoded)?)
}

/// Writes `traceparent`/`tracestate`/`baggage` headers for `cx` into the
/// carrier.
pub fn inject_distributed_headers(cx: &Context, headers: &mut dyn Injector) {
    propagator().inject_context(cx, headers);
}

/// Reconstructs an encoded parent string from incoming request headers.
///
/// The carrier must hold a usable `traceparent` (an absent or all-zero span
/// context is [`Error::UnresolvedParent`]) and a parseable
/// `braintrust.parent` baggage entry (missing or malformed is also
/// [`Error::UnresolvedParent`]). The returned string is an encoded identity
/// whose row id is the [`FOREIGN_ROW_ID`] sentinel.
pub fn parent_from_headers(headers: &dyn Extractor) -> Result<String> {
    let cx = propagator().extract(headers);
    let span_context = cx.span().span_context().clone();
    if !span_context.is_valid() {
        return Err(Error::UnresolvedParent("no usable traceparent header"));
    }
    let descriptor = cx
        .baggage()
        .get(PARENT_DESCRIPTOR_KEY)
        .map(|value| value.as_str().to_string())
        .ok_or(Error::UnresolvedParent("no parent descriptor in baggage"))?;
    let descriptor: ParentDescriptor = descriptor.parse()?;

    let (kind, owner) = descriptor.into_owner();
    let identity = SpanIdentity::new(kind, owner).with_position(TracePosition::new(
        FOREIGN_ROW_ID,
        format!("{:016x}", span_context.span_id()),
        format!("{:032x}", span_context.trace_id()),
    ));
    Ok(identity.encode())
}

/// Best-effort variant of [`parent_from_headers`].
///
/// This is the one place extraction failures are swallowed: the error is
/// logged as a warning and the caller proceeds without a parent.
pub fn try_parent_from_headers(headers: &dyn Extractor) -> Option<String> {
    match parent_from_headers(headers) {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            bt_warn!(
                name: "propagation.parent_unresolved",
                error = err.to_string()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braintrust_tracing::identity::{OwnerKind, OwnerRef};
    use braintrust_tracing::idgen::IdentitySpace;
    use braintrust_tracing::tracer::Tracer;
    use std::collections::HashMap;

    const SAMPLE_TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn export_to_headers_round_trip() {
        let identity = SpanIdentity::new(OwnerKind::Experiment, OwnerRef::Id("e1".into()))
            .with_position(TracePosition::new(
                "row-1",
                "00f067aa0ba902b7",
                "4bf92f3577b34da6a3ce929d0e0e4736",
            ));

        let cx = context_from_export(&identity.encode()).unwrap();
        let mut headers = HashMap::new();
        inject_distributed_headers(&cx, &mut headers);

        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some(SAMPLE_TRACEPARENT)
        );
        assert_eq!(
            headers.get("baggage").map(String::as_str),
            Some("braintrust.parent=experiment_id:e1")
        );

        let reimported = parent_from_headers(&headers).unwrap();
        let parent = SpanIdentity::decode(&reimported).unwrap();
        assert_eq!(parent.owner_kind(), OwnerKind::Experiment);
        assert_eq!(parent.owner().as_id(), Some("e1"));
        let position = parent.position().unwrap();
        assert_eq!(position.row_id(), FOREIGN_ROW_ID);
        assert_eq!(position.span_id(), "00f067aa0ba902b7");
        assert_eq!(position.root_span_id(), "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn canonical_uuid_root_crosses_as_compact_hex() {
        let identity = SpanIdentity::new(OwnerKind::ProjectLogs, OwnerRef::Id("p1".into()))
            .with_position(TracePosition::new(
                "11111111-2222-3333-4444-555555555555",
                "00f067aa0ba902b7",
                "4bf92f35-77b3-4da6-a3ce-929d0e0e4736",
            ));

        let cx = context_from_identity(&identity).unwrap();
        let mut headers = HashMap::new();
        inject_distributed_headers(&cx, &mut headers);

        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some(SAMPLE_TRACEPARENT)
        );
    }

    #[test]
    fn lookup_owner_rides_as_a_name_descriptor() {
        let mut lookup = serde_json::Map::new();
        lookup.insert(
            "project_name".to_owned(),
            serde_json::Value::String("chatbot".to_owned()),
        );
        let identity = SpanIdentity::new(OwnerKind::ProjectLogs, OwnerRef::Lookup(lookup))
            .with_position(TracePosition::new(
                "row-1",
                "00f067aa0ba902b7",
                "4bf92f3577b34da6a3ce929d0e0e4736",
            ));

        let cx = context_from_identity(&identity).unwrap();
        let mut headers = HashMap::new();
        inject_distributed_headers(&cx, &mut headers);

        assert_eq!(
            headers.get("baggage").map(String::as_str),
            Some("braintrust.parent=project_name:chatbot")
        );
    }

    #[test]
    fn owner_only_identity_cannot_build_a_context() {
        let identity = SpanIdentity::new(OwnerKind::ProjectLogs, OwnerRef::Id("p1".into()));
        assert!(matches!(
            context_from_identity(&identity),
            Err(Error::MissingRequiredField(_))
        ));
    }

    #[test]
    fn uuid_span_id_cannot_cross() {
        let identity = SpanIdentity::new(OwnerKind::Experiment, OwnerRef::Id("e1".into()))
            .with_position(TracePosition::new(
                "row-1",
                "11111111-2222-3333-4444-555555555555",
                "4bf92f3577b34da6a3ce929d0e0e4736",
            ));
        assert!(matches!(
            context_from_identity(&identity),
            Err(Error::InvalidEncoding)
        ));
    }

    #[test]
    fn import_requires_a_traceparent() {
        let headers: HashMap<String, String> = HashMap::new();
        assert!(matches!(
            parent_from_headers(&headers),
            Err(Error::UnresolvedParent(_))
        ));
    }

    #[test]
    fn all_zero_traceparent_is_unresolved() {
        let mut headers = HashMap::new();
        headers.insert(
            "traceparent".to_owned(),
            "00-00000000000000000000000000000000-0000000000000000-01".to_owned(),
        );
        headers.insert(
            "baggage".to_owned(),
            "braintrust.parent=project_id:p1".to_owned(),
        );
        assert!(matches!(
            parent_from_headers(&headers),
            Err(Error::UnresolvedParent(_))
        ));
    }

    #[test]
    fn missing_baggage_descriptor_is_unresolved() {
        let mut headers = HashMap::new();
        headers.insert("traceparent".to_owned(), SAMPLE_TRACEPARENT.to_owned());
        assert!(matches!(
            parent_from_headers(&headers),
            Err(Error::UnresolvedParent(_))
        ));
    }

    #[test]
    fn malformed_descriptor_is_unresolved() {
        let mut headers = HashMap::new();
        headers.insert("traceparent".to_owned(), SAMPLE_TRACEPARENT.to_owned());
        headers.insert(
            "baggage".to_owned(),
            "braintrust.parent=not a descriptor".to_owned(),
        );
        assert!(matches!(
            parent_from_headers(&headers),
            Err(Error::UnresolvedParent(_))
        ));
    }

    #[test]
    fn descriptor_is_found_among_other_baggage_entries() {
        let mut headers = HashMap::new();
        headers.insert("traceparent".to_owned(), SAMPLE_TRACEPARENT.to_owned());
        headers.insert(
            "baggage".to_owned(),
            "userId=alice,braintrust.parent=project_id:p1,ttl=1".to_owned(),
        );

        let encoded = parent_from_headers(&headers).unwrap();
        let parent = SpanIdentity::decode(&encoded).unwrap();
        assert_eq!(parent.owner_kind(), OwnerKind::ProjectLogs);
        assert_eq!(parent.owner().as_id(), Some("p1"));
    }

    #[test]
    fn try_variant_swallows_the_failure() {
        let headers: HashMap<String, String> = HashMap::new();
        assert!(try_parent_from_headers(&headers).is_none());
    }

    #[test]
    fn imported_parent_seeds_a_tracer() {
        let mut headers = HashMap::new();
        headers.insert("traceparent".to_owned(), SAMPLE_TRACEPARENT.to_owned());
        headers.insert(
            "baggage".to_owned(),
            "braintrust.parent=project_id:p1".to_owned(),
        );

        let encoded = parent_from_headers(&headers).unwrap();
        let tracer = Tracer::builder(OwnerKind::Experiment, OwnerRef::Id("unused".into()))
            .with_identity_space(IdentitySpace::Interop)
            .build();
        let span = tracer.start_span_with_parent("handler", &encoded).unwrap();

        assert_eq!(span.owner_kind(), OwnerKind::ProjectLogs);
        assert_eq!(span.owner().as_id(), Some("p1"));
        assert_eq!(span.root_span_id(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(span.parents(), ["00f067aa0ba902b7"]);
    }
}
