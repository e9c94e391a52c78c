//! Pluggable id-minting strategies.
//!
//! The tracer consults an injected [`IdGenerator`] every time a span needs a
//! fresh id; nothing here is process-global. The two built-in strategies
//! correspond to the two id spaces spans can live in, selected once at
//! startup via [`IdentitySpace`].

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use rand::{rngs, Rng, SeedableRng};
use uuid::Uuid;

/// The format family for span and trace ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdentitySpace {
    /// Opaque UUIDs; a root span doubles as its own trace root.
    #[default]
    Native,
    /// Fixed-width lower-case hex ids sized for W3C trace context
    /// (8-byte span ids, 16-byte trace ids); root spans get a trace id
    /// distinct from their span id.
    Interop,
}

impl IdentitySpace {
    /// The built-in generator for this space.
    pub fn generator(self) -> Arc<dyn IdGenerator> {
        match self {
            IdentitySpace::Native => Arc::new(UuidIdGenerator::default()),
            IdentitySpace::Interop => Arc::new(W3cIdGenerator::default()),
        }
    }
}

/// Interface for generating new span/trace ids.
///
/// Every call must return a fresh value; ids are never cached or reused
/// across calls.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new span id.
    fn new_span_id(&self) -> String;

    /// Generate a new trace-root id.
    fn new_trace_id(&self) -> String;

    /// Whether a span started without a parent reuses its span id as the
    /// root span id, instead of minting a distinct trace id.
    fn root_reuses_span_id(&self) -> bool;
}

/// Mints random UUIDs, the native id space.
#[derive(Clone, Debug, Default)]
pub struct UuidIdGenerator {
    _private: (),
}

impl IdGenerator for UuidIdGenerator {
    fn new_span_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn new_trace_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn root_reuses_span_id(&self) -> bool {
        true
    }
}

/// Mints fixed-width lower-case hex ids matching the W3C trace-context
/// widths, for traces shared with an OpenTelemetry pipeline.
#[derive(Clone, Debug, Default)]
pub struct W3cIdGenerator {
    _private: (),
}

impl IdGenerator for W3cIdGenerator {
    fn new_span_id(&self) -> String {
        CURRENT_RNG.with(|rng| format!("{:016x}", rng.borrow_mut().gen::<u64>()))
    }

    fn new_trace_id(&self) -> String {
        CURRENT_RNG.with(|rng| format!("{:032x}", rng.borrow_mut().gen::<u128>()))
    }

    fn root_reuses_span_id(&self) -> bool {
        false
    }
}

thread_local! {
    /// Rng for hex id generation, seeded once per thread.
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// Deterministic generator for tests: `span-1`, `trace-2`, ...
#[cfg(any(feature = "testing", test))]
#[derive(Debug)]
pub struct SequenceIdGenerator {
    next: std::sync::atomic::AtomicU64,
    root_reuses_span_id: bool,
}

#[cfg(any(feature = "testing", test))]
impl SequenceIdGenerator {
    /// Starts counting at 1 with the given root policy.
    pub fn new(root_reuses_span_id: bool) -> Self {
        SequenceIdGenerator {
            next: std::sync::atomic::AtomicU64::new(1),
            root_reuses_span_id,
        }
    }

    fn next(&self) -> u64 {
        self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(any(feature = "testing", test))]
impl IdGenerator for SequenceIdGenerator {
    fn new_span_id(&self) -> String {
        format!("span-{}", self.next())
    }

    fn new_trace_id(&self) -> String {
        format!("trace-{}", self.next())
    }

    fn root_reuses_span_id(&self) -> bool {
        self.root_reuses_span_id
    }
}
