//! Versioned wire codec for [`SpanIdentity`].
//!
//! Current layout (generation 3), before base64:
//!
//! ```text
//! version:u8 | owner_kind:u8 | uuid_entry_count:u8
//!   | (field_tag:u8, uuid:[u8; 16]) * uuid_entry_count
//!   | optional UTF-8 JSON object
//! ```
//!
//! Identity fields whose value is a canonically-spelled UUID take a compact
//! 17-byte record; every other value (interop hex ids, arbitrary strings,
//! lookup arguments, the propagated event) rides in the trailing JSON
//! object, keyed by field name. The codec never inspects which id space a
//! value came from; the UUID parse is the only discriminator.
//!
//! Generations 1 and 2 were version-prefixed JSON. Decoding dispatches
//! through [`DECODERS`]; each legacy decoder parses its own payload shape
//! and hands the result up the upgrade chain.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{OwnerKind, OwnerRef, SpanIdentity, TracePosition};
use crate::{Error, Result};

/// Version tag written by the current encoder.
pub const ENCODING_VERSION: u8 = 3;

const FIELD_OBJECT_ID: u8 = 1;
const FIELD_ROW_ID: u8 = 2;
const FIELD_SPAN_ID: u8 = 3;
const FIELD_ROOT_SPAN_ID: u8 = 4;

/// One compact record: field tag plus raw UUID bytes.
const UUID_ENTRY_LEN: usize = 17;

type VersionDecoder = fn(&[u8]) -> Result<SpanIdentity>;

/// Decoder per generation, indexed by `version - 1`.
const DECODERS: [VersionDecoder; ENCODING_VERSION as usize] = [decode_v1, decode_v2, decode_v3];

pub(crate) fn encode(identity: &SpanIdentity) -> String {
    let mut entries = Vec::new();
    let mut entry_count: u8 = 0;
    let mut side = Map::new();
    {
        let mut pack = |tag: u8, key: &str, value: &str| match canonical_uuid_bytes(value) {
            Some(bytes) => {
                entries.push(tag);
                entries.extend_from_slice(&bytes);
                entry_count += 1;
            }
            None => {
                side.insert(key.to_owned(), Value::String(value.to_owned()));
            }
        };
        if let OwnerRef::Id(id) = identity.owner() {
            pack(FIELD_OBJECT_ID, "object_id", id);
        }
        if let Some(position) = identity.position() {
            pack(FIELD_ROW_ID, "row_id", position.row_id());
            pack(FIELD_SPAN_ID, "span_id", position.span_id());
            pack(FIELD_ROOT_SPAN_ID, "root_span_id", position.root_span_id());
        }
    }
    if let OwnerRef::Lookup(args) = identity.owner() {
        side.insert("object_lookup".to_owned(), Value::Object(args.clone()));
    }
    if let Some(event) = identity.propagated_event() {
        side.insert("propagated_event".to_owned(), Value::Object(event.clone()));
    }

    let mut buf = vec![
        ENCODING_VERSION,
        identity.owner_kind().wire_byte(),
        entry_count,
    ];
    buf.extend_from_slice(&entries);
    if !side.is_empty() {
        // `serde_json::Map` keeps keys sorted, so re-encoding an unchanged
        // identity is byte-identical.
        buf.extend_from_slice(Value::Object(side).to_string().as_bytes());
    }
    STANDARD.encode(buf)
}

pub(crate) fn decode(encoded: &str) -> Result<SpanIdentity> {
    let bytes = STANDARD.decode(encoded).map_err(|_| Error::InvalidEncoding)?;
    let (&version, payload) = bytes.split_first().ok_or(Error::InvalidEncoding)?;
    match version {
        1..=ENCODING_VERSION => DECODERS[version as usize - 1](payload),
        _ => Err(Error::InvalidEncoding),
    }
}

/// A value may use the compact form only when it is the canonical
/// lower-case hyphenated UUID spelling: `Uuid::parse_str` also accepts
/// un-hyphenated and upper-case inputs, which must keep their exact bytes
/// through the JSON side-channel instead.
fn canonical_uuid_bytes(value: &str) -> Option<[u8; 16]> {
    let uuid = Uuid::parse_str(value).ok()?;
    if uuid.hyphenated().to_string() == value {
        Some(*uuid.as_bytes())
    } else {
        None
    }
}

/// Generation 1 payload: JSON with the legacy owner-kind spelling and no
/// lookup-args or propagated-event support.
#[derive(Debug, Deserialize)]
struct JsonPayloadV1 {
    object_type: String,
    object_id: Option<String>,
    row_id: Option<String>,
    span_id: Option<String>,
    root_span_id: Option<String>,
}

/// Generation 2 payload: JSON with the numeric owner kind. Generation 3
/// lowers its binary header and compact entries into this same shape before
/// validation, so there is exactly one terminal builder.
#[derive(Debug, Deserialize)]
struct JsonPayloadV2 {
    object_type: u8,
    #[serde(flatten)]
    fields: SideFields,
}

/// The by-name identity fields, shared between the generation 2 payload and
/// the generation 3 side object.
#[derive(Debug, Default, Deserialize)]
struct SideFields {
    object_id: Option<String>,
    object_lookup: Option<Map<String, Value>>,
    row_id: Option<String>,
    span_id: Option<String>,
    root_span_id: Option<String>,
    propagated_event: Option<Map<String, Value>>,
}

fn decode_v1(payload: &[u8]) -> Result<SpanIdentity> {
    let parsed: JsonPayloadV1 =
        serde_json::from_slice(payload).map_err(|_| Error::InvalidEncoding)?;
    upgrade_v2(upgrade_v1(parsed)?)
}

fn decode_v2(payload: &[u8]) -> Result<SpanIdentity> {
    let parsed: JsonPayloadV2 =
        serde_json::from_slice(payload).map_err(|_| Error::InvalidEncoding)?;
    upgrade_v2(parsed)
}

fn decode_v3(payload: &[u8]) -> Result<SpanIdentity> {
    let (&kind_byte, rest) = payload.split_first().ok_or(Error::InvalidEncoding)?;
    let (&count, rest) = rest.split_first().ok_or(Error::InvalidEncoding)?;
    let entries_len = count as usize * UUID_ENTRY_LEN;
    if rest.len() < entries_len {
        return Err(Error::InvalidEncoding);
    }
    let (entries, side) = rest.split_at(entries_len);

    let mut fields = SideFields::default();
    for entry in entries.chunks_exact(UUID_ENTRY_LEN) {
        let uuid = Uuid::from_slice(&entry[1..]).map_err(|_| Error::InvalidEncoding)?;
        let value = Some(uuid.hyphenated().to_string());
        match entry[0] {
            FIELD_OBJECT_ID => merge_field(&mut fields.object_id, value)?,
            FIELD_ROW_ID => merge_field(&mut fields.row_id, value)?,
            FIELD_SPAN_ID => merge_field(&mut fields.span_id, value)?,
            FIELD_ROOT_SPAN_ID => merge_field(&mut fields.root_span_id, value)?,
            _ => return Err(Error::InvalidEncoding),
        }
    }

    if !side.is_empty() {
        let extra: SideFields =
            serde_json::from_slice(side).map_err(|_| Error::InvalidEncoding)?;
        merge_field(&mut fields.object_id, extra.object_id)?;
        merge_field(&mut fields.object_lookup, extra.object_lookup)?;
        merge_field(&mut fields.row_id, extra.row_id)?;
        merge_field(&mut fields.span_id, extra.span_id)?;
        merge_field(&mut fields.root_span_id, extra.root_span_id)?;
        merge_field(&mut fields.propagated_event, extra.propagated_event)?;
    }

    upgrade_v2(JsonPayloadV2 {
        object_type: kind_byte,
        fields,
    })
}

/// A field present both compactly and in the side object is forged input.
fn merge_field<T>(slot: &mut Option<T>, value: Option<T>) -> Result<()> {
    if let Some(value) = value {
        if slot.replace(value).is_some() {
            return Err(Error::InvalidEncoding);
        }
    }
    Ok(())
}

fn upgrade_v1(payload: JsonPayloadV1) -> Result<JsonPayloadV2> {
    Ok(JsonPayloadV2 {
        object_type: OwnerKind::from_legacy_name(&payload.object_type)?.wire_byte(),
        fields: SideFields {
            object_id: payload.object_id,
            object_lookup: None,
            row_id: payload.row_id,
            span_id: payload.span_id,
            root_span_id: payload.root_span_id,
            propagated_event: None,
        },
    })
}

fn upgrade_v2(payload: JsonPayloadV2) -> Result<SpanIdentity> {
    let kind = OwnerKind::from_wire_byte(payload.object_type)?;
    let fields = payload.fields;
    let owner = match (fields.object_id, fields.object_lookup) {
        (Some(id), None) => OwnerRef::Id(id),
        (None, Some(args)) => OwnerRef::Lookup(args),
        _ => return Err(Error::InvalidEncoding),
    };
    let position = match (fields.row_id, fields.span_id, fields.root_span_id) {
        (Some(row), Some(span), Some(root)) => Some(TracePosition::new(row, span, root)),
        (None, None, None) => None,
        _ => return Err(Error::InvalidEncoding),
    };
    let mut identity = SpanIdentity::new(kind, owner);
    if let Some(position) = position {
        identity = identity.with_position(position);
    }
    if let Some(event) = fields.propagated_event {
        identity = identity.with_propagated_event(event);
    }
    Ok(identity)
}
