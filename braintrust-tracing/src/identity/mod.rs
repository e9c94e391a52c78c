//! Span identity: who owns a trace and where a span sits inside it.
//!
//! A [`SpanIdentity`] names the owning object (an experiment or a log
//! stream), optionally the row/span/root-span coordinates of one position in
//! a trace, and an optional event payload propagated to descendants. It is
//! immutable once constructed and travels between processes as an opaque
//! base64 string produced by [`SpanIdentity::encode`].
//!
//! ```
//! use braintrust_tracing::identity::{OwnerKind, OwnerRef, SpanIdentity, TracePosition};
//!
//! let identity = SpanIdentity::new(OwnerKind::ProjectLogs, OwnerRef::Id("p1".to_owned()))
//!     .with_position(TracePosition::new("r1", "s1", "s1"));
//! let encoded = identity.encode();
//! assert_eq!(SpanIdentity::decode(&encoded).unwrap(), identity);
//! ```

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::{Error, Result};

mod codec;

pub use codec::ENCODING_VERSION;

/// The category of owning object a trace is recorded under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// A span recorded under an experiment.
    Experiment,
    /// A span recorded under a project's log stream.
    ProjectLogs,
    /// A span recorded under a playground session's log stream.
    PlaygroundLogs,
}

impl OwnerKind {
    /// Byte value used by the binary encoding.
    pub(crate) fn wire_byte(self) -> u8 {
        match self {
            OwnerKind::Experiment => 1,
            OwnerKind::ProjectLogs => 2,
            OwnerKind::PlaygroundLogs => 3,
        }
    }

    pub(crate) fn from_wire_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(OwnerKind::Experiment),
            2 => Ok(OwnerKind::ProjectLogs),
            3 => Ok(OwnerKind::PlaygroundLogs),
            _ => Err(Error::InvalidEncoding),
        }
    }

    /// Spelling used by the first encoding generation.
    pub(crate) fn legacy_name(self) -> &'static str {
        match self {
            OwnerKind::Experiment => "experiment",
            OwnerKind::ProjectLogs => "project_logs",
            OwnerKind::PlaygroundLogs => "playground_logs",
        }
    }

    pub(crate) fn from_legacy_name(name: &str) -> Result<Self> {
        match name {
            "experiment" => Ok(OwnerKind::Experiment),
            "project_logs" => Ok(OwnerKind::ProjectLogs),
            "playground_logs" => Ok(OwnerKind::PlaygroundLogs),
            _ => Err(Error::InvalidEncoding),
        }
    }

    /// The word prefixing parent descriptor entries, e.g. `project` in
    /// `project_id:p1`.
    pub fn descriptor_word(self) -> &'static str {
        match self {
            OwnerKind::Experiment => "experiment",
            OwnerKind::ProjectLogs => "project",
            OwnerKind::PlaygroundLogs => "playground",
        }
    }

    fn from_descriptor_word(word: &str) -> Option<Self> {
        match word {
            "experiment" => Some(OwnerKind::Experiment),
            "project" => Some(OwnerKind::ProjectLogs),
            "playground" => Some(OwnerKind::PlaygroundLogs),
            _ => None,
        }
    }
}

/// How the owning object is addressed: by resolved id, or by lookup
/// arguments when the id is not known yet (e.g. lookup by name).
///
/// Exactly one of the two applies to any identity, which this enum
/// guarantees by construction.
#[derive(Clone, Debug, PartialEq)]
pub enum OwnerRef {
    /// The owner's resolved id.
    Id(String),
    /// Arguments for resolving the owner later.
    Lookup(Map<String, Value>),
}

impl OwnerRef {
    /// The resolved id, if this reference carries one.
    pub fn as_id(&self) -> Option<&str> {
        match self {
            OwnerRef::Id(id) => Some(id),
            OwnerRef::Lookup(_) => None,
        }
    }

    /// The lookup arguments, if this reference carries them.
    pub fn as_lookup(&self) -> Option<&Map<String, Value>> {
        match self {
            OwnerRef::Id(_) => None,
            OwnerRef::Lookup(args) => Some(args),
        }
    }
}

/// The row/span/root-span coordinates of one position in a trace.
///
/// The three ids always travel together; an identity either has all of them
/// or none (an owner-only identity, usable as a root parent).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracePosition {
    row_id: String,
    span_id: String,
    root_span_id: String,
}

impl TracePosition {
    /// Builds a position from its three coordinates.
    pub fn new(
        row_id: impl Into<String>,
        span_id: impl Into<String>,
        root_span_id: impl Into<String>,
    ) -> Self {
        TracePosition {
            row_id: row_id.into(),
            span_id: span_id.into(),
            root_span_id: root_span_id.into(),
        }
    }

    /// Storage row id of the span's data.
    pub fn row_id(&self) -> &str {
        &self.row_id
    }

    /// Id of the span within its trace.
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Id of the root span of the trace.
    pub fn root_span_id(&self) -> &str {
        &self.root_span_id
    }
}

/// The logical identity of a position in a trace.
///
/// Constructed either when a span starts or when an encoded parent string is
/// decoded; immutable afterwards. The `with_*` builders consume `self` so a
/// finished identity can never change underneath a holder.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanIdentity {
    owner_kind: OwnerKind,
    owner: OwnerRef,
    position: Option<TracePosition>,
    propagated_event: Option<Map<String, Value>>,
}

impl SpanIdentity {
    /// An owner-only identity, addressing a container rather than a span.
    pub fn new(owner_kind: OwnerKind, owner: OwnerRef) -> Self {
        SpanIdentity {
            owner_kind,
            owner,
            position: None,
            propagated_event: None,
        }
    }

    /// Pins the identity to one row/span/root position.
    pub fn with_position(mut self, position: TracePosition) -> Self {
        self.position = Some(position);
        self
    }

    /// Attaches an event payload copied onto every descendant span.
    pub fn with_propagated_event(mut self, event: Map<String, Value>) -> Self {
        self.propagated_event = Some(event);
        self
    }

    /// Kind of the owning scope.
    pub fn owner_kind(&self) -> OwnerKind {
        self.owner_kind
    }

    /// Reference to the owning scope.
    pub fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    /// Trace position, or `None` for an owner-only identity.
    pub fn position(&self) -> Option<&TracePosition> {
        self.position.as_ref()
    }

    /// Event fields copied onto every descendant span.
    pub fn propagated_event(&self) -> Option<&Map<String, Value>> {
        self.propagated_event.as_ref()
    }

    /// Serializes the identity into its opaque portable form.
    ///
    /// The output is deterministic: encoding an unchanged identity twice
    /// yields byte-identical strings.
    pub fn encode(&self) -> String {
        codec::encode(self)
    }

    /// Parses an encoded identity of any supported generation.
    ///
    /// Strings from older generations are upgraded on the way in. Any
    /// malformed input fails with [`Error::InvalidEncoding`] and nothing
    /// else.
    pub fn decode(encoded: &str) -> Result<Self> {
        codec::decode(encoded)
    }

    /// The compact `kind:value` rendering of this identity's owner.
    pub fn parent_descriptor(&self) -> Result<ParentDescriptor> {
        ParentDescriptor::new(self.owner_kind, self.owner.clone())
    }
}

/// A compact `kind:value` rendering of an owning object, small enough to
/// ride in propagation baggage and span attributes.
///
/// The string form is `<word>_id:<value>` for a resolved owner and
/// `<word>_name:<value>` for a by-name lookup, where `<word>` is
/// [`OwnerKind::descriptor_word`].
#[derive(Clone, Debug, PartialEq)]
pub struct ParentDescriptor {
    kind: OwnerKind,
    owner: OwnerRef,
}

impl ParentDescriptor {
    /// Builds a descriptor, failing when the owner reference has no
    /// two-field rendering (lookup maps other than a single
    /// `<word>_name` string entry).
    pub fn new(kind: OwnerKind, owner: OwnerRef) -> Result<Self> {
        if let OwnerRef::Lookup(args) = &owner {
            let mut entries = args.iter();
            let name_key = format!("{}_name", kind.descriptor_word());
            match (entries.next(), entries.next()) {
                (Some((key, Value::String(_))), None) if *key == name_key => {}
                _ => return Err(Error::MissingRequiredField("owner descriptor")),
            }
        }
        Ok(ParentDescriptor { kind, owner })
    }

    /// Kind of the described owner.
    pub fn kind(&self) -> OwnerKind {
        self.kind
    }

    /// Reference to the described owner.
    pub fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    /// Consumes the descriptor into its owner parts.
    pub fn into_owner(self) -> (OwnerKind, OwnerRef) {
        (self.kind, self.owner)
    }
}

impl fmt::Display for ParentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.kind.descriptor_word();
        match &self.owner {
            OwnerRef::Id(id) => write!(f, "{word}_id:{id}"),
            OwnerRef::Lookup(args) => {
                // Validated single-entry shape, see `new`.
                let name = args.values().next().and_then(Value::as_str).unwrap_or("");
                write!(f, "{word}_name:{name}")
            }
        }
    }
}

impl FromStr for ParentDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = Error::UnresolvedParent("malformed parent descriptor");
        let (key, value) = s.split_once(':').ok_or(malformed.clone())?;
        if value.is_empty() {
            return Err(malformed);
        }
        let (word, suffix) = key.rsplit_once('_').ok_or(malformed.clone())?;
        let kind = OwnerKind::from_descriptor_word(word).ok_or(malformed.clone())?;
        let owner = match suffix {
            "id" => OwnerRef::Id(value.to_owned()),
            "name" => {
                let mut args = Map::new();
                args.insert(key.to_owned(), Value::String(value.to_owned()));
                OwnerRef::Lookup(args)
            }
            _ => return Err(malformed),
        };
        Ok(ParentDescriptor { kind, owner })
    }
}
