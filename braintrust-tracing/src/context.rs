//! Active-span bookkeeping.
//!
//! A [`ContextManager`] tracks which span is active on the current logical
//! scope and answers the two questions the [`Tracer`] asks when it starts a
//! span: *which native span is active?* and *which parent ids should a new
//! span attach under?*. The manager is injected into the tracer at build
//! time, so the same tracer code serves both the purely native
//! [`NativeContextManager`] here and interop managers layered over other
//! tracing systems.
//!
//! [`Tracer`]: crate::tracer::Tracer

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::tracer::Span;

/// Parent coordinates resolved from the active scope.
///
/// `parents` usually holds exactly one span id. It is a list so that interop
/// managers can surface multi-parent links recorded by a foreign tracing
/// system; the tracer attaches new spans under the first entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentSpanIds {
    /// Root span id of the trace being continued.
    pub root_span_id: String,
    /// Span ids of the immediate parents.
    pub parents: Vec<String>,
}

/// Scope guard returned by [`ContextManager::attach`].
///
/// Dropping the guard detaches the span and restores whatever was active
/// before. Guards are thread-bound and must drop on the thread that created
/// them.
#[allow(missing_debug_implementations)]
#[must_use]
pub struct ActiveSpanGuard {
    // Dropping the boxed scope is what performs the detach. `None` means
    // there is nothing to restore.
    scope: Option<Box<dyn Any>>,
}

impl ActiveSpanGuard {
    /// A guard that restores nothing on drop.
    ///
    /// Managers hand this out when attachment could not be performed, so
    /// that callers never observe a failure from entering a span scope.
    pub fn noop() -> Self {
        ActiveSpanGuard { scope: None }
    }

    /// Wraps a droppable scope state.
    pub fn from_scope<S: Any>(scope: S) -> Self {
        ActiveSpanGuard {
            scope: Some(Box::new(scope)),
        }
    }

    /// Whether dropping this guard will restore a previous scope.
    pub fn is_active(&self) -> bool {
        self.scope.is_some()
    }
}

/// Tracks the active span for the current logical scope.
///
/// Implementations never report errors. If the underlying scope storage is
/// unavailable, [`attach`] emits a diagnostic and returns a no-op guard, and
/// the query methods return `None`. Tracing must never take down the traced
/// application.
///
/// [`attach`]: ContextManager::attach
pub trait ContextManager: Send + Sync + fmt::Debug {
    /// Makes `span` the active span until the returned guard drops.
    fn attach(&self, span: Arc<Span>) -> ActiveSpanGuard;

    /// The active native span on this scope, if any.
    fn current_span(&self) -> Option<Arc<Span>>;

    /// Root and parent span ids a new span should attach under.
    ///
    /// The default derives both from [`current_span`]; interop managers
    /// override this to also surface parents recorded by a foreign tracing
    /// system when no native span is active.
    ///
    /// [`current_span`]: ContextManager::current_span
    fn parent_span_ids(&self) -> Option<ParentSpanIds> {
        self.current_span().map(|span| ParentSpanIds {
            root_span_id: span.root_span_id().to_owned(),
            parents: vec![span.span_id().to_owned()],
        })
    }
}

/// Runs `f` with `span` active on the current scope.
///
/// The span is detached again when `f` returns, even if it unwinds.
pub fn with_active_span<M, T>(manager: &M, span: Arc<Span>, f: impl FnOnce() -> T) -> T
where
    M: ContextManager + ?Sized,
{
    let _guard = manager.attach(span);
    f()
}

thread_local! {
    static ACTIVE_SPANS: RefCell<Vec<Arc<Span>>> = const { RefCell::new(Vec::new()) };
}

/// Context manager for purely native tracing.
///
/// Active spans live on a per-thread stack, so nesting works the obvious
/// way: attaching pushes, dropping the guard pops back to the depth the
/// guard captured. All instances share the calling thread's stack.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use braintrust_tracing::context::ContextManager;
/// use braintrust_tracing::identity::{OwnerKind, OwnerRef};
/// use braintrust_tracing::tracer::Tracer;
///
/// let tracer = Tracer::builder(OwnerKind::Experiment, OwnerRef::Id("exp-1".into())).build();
/// let manager = tracer.context_manager();
///
/// let root = Arc::new(tracer.start_span("request"));
/// {
///     let _guard = manager.attach(root.clone());
///     let child = tracer.start_span("handler");
///     assert_eq!(child.parents(), [root.span_id()]);
/// }
/// assert!(manager.current_span().is_none());
/// ```
#[derive(Debug, Default)]
pub struct NativeContextManager {
    _private: (),
}

impl NativeContextManager {
    /// Creates a manager over the calling thread's span stack.
    pub fn new() -> Self {
        NativeContextManager::default()
    }
}

// Restores the thread's stack to the depth captured at attach time. `try_with`
// keeps drops during thread teardown from panicking.
struct ActiveScope {
    depth: usize,
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        let _ = ACTIVE_SPANS.try_with(|stack| stack.borrow_mut().truncate(self.depth));
    }
}

impl ContextManager for NativeContextManager {
    fn attach(&self, span: Arc<Span>) -> ActiveSpanGuard {
        let depth = ACTIVE_SPANS
            .try_with(|stack| {
                let mut stack = stack.borrow_mut();
                stack.push(span);
                stack.len() - 1
            })
            .ok();
        match depth {
            Some(depth) => ActiveSpanGuard::from_scope(ActiveScope { depth }),
            None => {
                crate::bt_warn!(name: "context.attach_failed", reason = "thread local storage unavailable");
                ActiveSpanGuard::noop()
            }
        }
    }

    fn current_span(&self) -> Option<Arc<Span>> {
        ACTIVE_SPANS
            .try_with(|stack| stack.borrow().last().cloned())
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{OwnerKind, OwnerRef};
    use crate::idgen::SequenceIdGenerator;
    use crate::tracer::Tracer;

    fn test_tracer() -> Tracer {
        Tracer::builder(OwnerKind::Experiment, OwnerRef::Id("exp-ctx".into()))
            .with_id_generator(Arc::new(SequenceIdGenerator::new(true)))
            .build()
    }

    #[test]
    fn attach_nests_and_restores() {
        let tracer = test_tracer();
        let manager = NativeContextManager::new();

        let outer = Arc::new(tracer.start_span("outer"));
        let outer_guard = manager.attach(outer.clone());
        assert_eq!(
            manager.current_span().map(|s| s.span_id().to_owned()),
            Some(outer.span_id().to_owned())
        );

        let inner = Arc::new(tracer.start_span("inner"));
        let inner_guard = manager.attach(inner.clone());
        let ids = manager.parent_span_ids().unwrap();
        assert_eq!(ids.root_span_id, outer.root_span_id());
        assert_eq!(ids.parents, [inner.span_id().to_owned()]);

        drop(inner_guard);
        assert_eq!(
            manager.current_span().map(|s| s.span_id().to_owned()),
            Some(outer.span_id().to_owned())
        );

        drop(outer_guard);
        assert!(manager.current_span().is_none());
        assert!(manager.parent_span_ids().is_none());
    }

    #[test]
    fn with_active_span_scopes_the_closure() {
        let tracer = test_tracer();
        let manager = NativeContextManager::new();
        let span = Arc::new(tracer.start_span("scoped"));

        let seen = with_active_span(&manager, span.clone(), || {
            manager.current_span().map(|s| s.span_id().to_owned())
        });
        assert_eq!(seen, Some(span.span_id().to_owned()));
        assert!(manager.current_span().is_none());
    }

    #[test]
    fn stacks_are_thread_local() {
        let tracer = test_tracer();
        let manager = NativeContextManager::new();
        let span = Arc::new(tracer.start_span("pinned"));
        let _guard = manager.attach(span);

        let other = std::thread::spawn(|| {
            let manager = NativeContextManager::new();
            manager.current_span().is_none()
        })
        .join()
        .unwrap();
        assert!(other);
    }

    #[test]
    fn noop_guard_restores_nothing() {
        let guard = ActiveSpanGuard::noop();
        assert!(!guard.is_active());
        drop(guard);
    }
}
