//! Span creation.
//!
//! A [`Tracer`] mints [`Span`]s under a default owner scope, resolving the
//! parent for each new span in a fixed order: an explicitly supplied encoded
//! parent wins, then the active scope reported by the tracer's
//! [`ContextManager`], and otherwise the span starts a fresh trace rooted at
//! itself. Both the id strategy and the context manager are injected at
//! build time, so the same tracer drives native and interop deployments.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::{ContextManager, NativeContextManager, ParentSpanIds};
use crate::error::Result;
use crate::identity::{OwnerKind, OwnerRef, ParentDescriptor, SpanIdentity, TracePosition};
use crate::idgen::{IdGenerator, IdentitySpace};

/// A started span: an immutable identity plus its parent links.
///
/// Spans do not buffer attributes or events; they are the identity handle
/// that row-level payloads and interop layers hang data off. Clone is cheap
/// relative to span creation and spans are usually shared as `Arc<Span>`.
#[derive(Clone, Debug)]
pub struct Span {
    name: String,
    owner_kind: OwnerKind,
    owner: OwnerRef,
    position: TracePosition,
    propagated_event: Option<Map<String, Value>>,
    parents: Vec<String>,
}

impl Span {
    /// The name given at `start_span` time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of the owning scope.
    pub fn owner_kind(&self) -> OwnerKind {
        self.owner_kind
    }

    /// Reference to the owning scope.
    pub fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    /// Storage row id for this span's data.
    pub fn row_id(&self) -> &str {
        self.position.row_id()
    }

    /// Id of this span within its trace.
    pub fn span_id(&self) -> &str {
        self.position.span_id()
    }

    /// Id of the root span of this trace.
    pub fn root_span_id(&self) -> &str {
        self.position.root_span_id()
    }

    /// Event fields inherited by every descendant of this span.
    pub fn propagated_event(&self) -> Option<&Map<String, Value>> {
        self.propagated_event.as_ref()
    }

    /// Span ids of the immediate parents. Empty for trace roots.
    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    /// Whether this span roots its trace.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// The full identity of this span.
    pub fn identity(&self) -> SpanIdentity {
        let identity = SpanIdentity::new(self.owner_kind, self.owner.clone())
            .with_position(self.position.clone());
        match &self.propagated_event {
            Some(event) => identity.with_propagated_event(event.clone()),
            None => identity,
        }
    }

    /// Encodes this span's identity for handoff to another process.
    ///
    /// The returned string is accepted by [`Tracer::start_span_with_parent`]
    /// on the receiving side.
    pub fn export(&self) -> String {
        self.identity().encode()
    }

    /// Owner descriptor for propagation headers.
    ///
    /// Fails when the owner is a lookup that the descriptor grammar cannot
    /// express, see [`ParentDescriptor::new`].
    pub fn parent_descriptor(&self) -> Result<ParentDescriptor> {
        ParentDescriptor::new(self.owner_kind, self.owner.clone())
    }
}

/// Mints spans under a default owner scope.
///
/// # Examples
///
/// ```
/// use braintrust_tracing::identity::{OwnerKind, OwnerRef};
/// use braintrust_tracing::tracer::Tracer;
///
/// let tracer = Tracer::builder(OwnerKind::ProjectLogs, OwnerRef::Id("proj-1".into())).build();
/// let root = tracer.start_span("request");
/// assert_eq!(root.span_id(), root.root_span_id());
///
/// // Hand the encoded identity to another process and keep building there.
/// let exported = root.export();
/// let child = tracer.start_span_with_parent("worker", &exported).unwrap();
/// assert_eq!(child.root_span_id(), root.root_span_id());
/// assert_eq!(child.parents(), [root.span_id()]);
/// ```
#[derive(Debug)]
pub struct Tracer {
    owner_kind: OwnerKind,
    owner: OwnerRef,
    propagated_event: Option<Map<String, Value>>,
    id_generator: Arc<dyn IdGenerator>,
    context: Arc<dyn ContextManager>,
}

impl Tracer {
    /// Starts configuring a tracer owned by the given scope.
    pub fn builder(owner_kind: OwnerKind, owner: OwnerRef) -> TracerBuilder {
        TracerBuilder {
            owner_kind,
            owner,
            propagated_event: None,
            identity_space: IdentitySpace::default(),
            id_generator: None,
            context_manager: None,
        }
    }

    /// Starts a span under the active scope, or a fresh root if none.
    ///
    /// A native span active on the context manager contributes its owner,
    /// root and propagated event. When only foreign parent ids are visible
    /// (an interop manager with no native span active), the new span joins
    /// that trace under the tracer's own owner.
    pub fn start_span(&self, name: impl Into<String>) -> Span {
        if let Some(parent) = self.context.current_span() {
            return self.start_child(name.into(), &parent);
        }
        let link = self.context.parent_span_ids().and_then(|ids| {
            let ParentSpanIds {
                root_span_id,
                parents,
            } = ids;
            parents
                .into_iter()
                .next()
                .map(|parent| (root_span_id, parent))
        });
        self.mint(
            name.into(),
            self.owner_kind,
            self.owner.clone(),
            self.propagated_event.clone(),
            link,
        )
    }

    /// Starts a span under an encoded parent identity.
    ///
    /// The parent's owner, root and propagated event all carry over. An
    /// owner-only parent (no trace position) starts a new trace in that
    /// owner's scope. The active scope is ignored entirely.
    pub fn start_span_with_parent(&self, name: impl Into<String>, parent: &str) -> Result<Span> {
        let identity = SpanIdentity::decode(parent)?;
        let link = identity
            .position()
            .map(|p| (p.root_span_id().to_owned(), p.span_id().to_owned()));
        Ok(self.mint(
            name.into(),
            identity.owner_kind(),
            identity.owner().clone(),
            identity.propagated_event().cloned(),
            link,
        ))
    }

    /// Starts a span, attaches it for the duration of `f`, and detaches it
    /// again before returning.
    pub fn in_span<T>(&self, name: impl Into<String>, f: impl FnOnce(&Arc<Span>) -> T) -> T {
        let span = Arc::new(self.start_span(name));
        let _guard = self.context.attach(Arc::clone(&span));
        f(&span)
    }

    /// The context manager this tracer resolves scopes through.
    pub fn context_manager(&self) -> &Arc<dyn ContextManager> {
        &self.context
    }

    /// The id strategy this tracer mints ids with.
    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.id_generator
    }

    fn start_child(&self, name: String, parent: &Span) -> Span {
        self.mint(
            name,
            parent.owner_kind(),
            parent.owner().clone(),
            parent.propagated_event().cloned(),
            Some((
                parent.root_span_id().to_owned(),
                parent.span_id().to_owned(),
            )),
        )
    }

    fn mint(
        &self,
        name: String,
        owner_kind: OwnerKind,
        owner: OwnerRef,
        propagated_event: Option<Map<String, Value>>,
        link: Option<(String, String)>,
    ) -> Span {
        // The row id is minted with the span id strategy but is independent
        // of it: rows are storage coordinates, not trace coordinates.
        let row_id = self.id_generator.new_span_id();
        let span_id = self.id_generator.new_span_id();
        let (root_span_id, parents) = match link {
            Some((root_span_id, parent_span_id)) => (root_span_id, vec![parent_span_id]),
            None => {
                let root_span_id = if self.id_generator.root_reuses_span_id() {
                    span_id.clone()
                } else {
                    self.id_generator.new_trace_id()
                };
                (root_span_id, Vec::new())
            }
        };
        Span {
            name,
            owner_kind,
            owner,
            position: TracePosition::new(row_id, span_id, root_span_id),
            propagated_event,
            parents,
        }
    }
}

/// Configures and builds a [`Tracer`].
#[derive(Debug)]
pub struct TracerBuilder {
    owner_kind: OwnerKind,
    owner: OwnerRef,
    propagated_event: Option<Map<String, Value>>,
    identity_space: IdentitySpace,
    id_generator: Option<Arc<dyn IdGenerator>>,
    context_manager: Option<Arc<dyn ContextManager>>,
}

impl TracerBuilder {
    /// Selects the id strategy by identity space.
    ///
    /// Ignored if an explicit generator is set with [`with_id_generator`].
    ///
    /// [`with_id_generator`]: TracerBuilder::with_id_generator
    pub fn with_identity_space(mut self, space: IdentitySpace) -> Self {
        self.identity_space = space;
        self
    }

    /// Overrides the id generator.
    pub fn with_id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    /// Overrides the context manager. Defaults to [`NativeContextManager`].
    pub fn with_context_manager(mut self, manager: Arc<dyn ContextManager>) -> Self {
        self.context_manager = Some(manager);
        self
    }

    /// Event fields stamped on new roots and inherited by their descendants.
    pub fn with_propagated_event(mut self, event: Map<String, Value>) -> Self {
        self.propagated_event = Some(event);
        self
    }

    /// Builds the tracer.
    pub fn build(self) -> Tracer {
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| self.identity_space.generator());
        let context = self
            .context_manager
            .unwrap_or_else(|| Arc::new(NativeContextManager::new()));
        Tracer {
            owner_kind: self.owner_kind,
            owner: self.owner,
            propagated_event: self.propagated_event,
            id_generator,
            context,
        }
    }
}
