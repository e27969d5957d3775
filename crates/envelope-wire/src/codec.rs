//! Line-oriented envelope codec.
//!
//! Pure functions, no I/O. See the crate docs for the format.

use crate::error::{DecodeError, WireResult};
use crate::model::{
    Envelope, EnvelopeHeader, EnvelopeItem, ItemHeader, RESERVED_HEADER_KEYS, RESERVED_ITEM_KEYS,
};
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Item types whose envelopes must carry a correlation id under [`IdPolicy::Infer`].
const ID_BEARING_ITEM_TYPES: [&str; 3] = ["event", "transaction", "session"];

/// Whether the decoder insists on an `event_id` in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdPolicy {
    /// Always require an id.
    Required,
    /// Never require an id.
    #[default]
    Optional,
    /// Require an id when the envelope carries an event, transaction or session.
    Infer,
}

/// Encode an envelope to its wire bytes.
pub fn encode(envelope: &Envelope) -> WireResult<Vec<u8>> {
    let payload_len: usize = envelope.items().iter().map(|i| i.payload().len()).sum();
    let mut buf = Vec::with_capacity(128 + payload_len + 64 * envelope.items().len());

    // Compact JSON escapes control characters, so each record stays on one line
    serde_json::to_writer(&mut buf, wire_header(envelope.header()).as_ref())?;
    buf.push(b'\n');

    for item in envelope.items() {
        serde_json::to_writer(&mut buf, wire_item_header(item.header()).as_ref())?;
        buf.push(b'\n');
        buf.extend_from_slice(item.payload());
        buf.push(b'\n');
    }

    Ok(buf)
}

/// Decode an envelope without requiring a correlation id.
pub fn decode(data: &[u8]) -> Result<Envelope, DecodeError> {
    decode_with(data, IdPolicy::Optional)
}

/// Decode an envelope, applying `policy` to the header's `event_id`.
pub fn decode_with(data: &[u8], policy: IdPolicy) -> Result<Envelope, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::EmptyInput);
    }

    let (header_line, mut cursor) =
        read_line(data, 0).ok_or(DecodeError::MissingHeaderDelimiter)?;
    let header: EnvelopeHeader = serde_json::from_slice(header_line)
        .map_err(|e| DecodeError::MalformedHeader(e.to_string()))?;

    let mut items = Vec::new();
    loop {
        if only_line_breaks(&data[cursor..]) {
            break;
        }

        let index = items.len();
        let (line, payload_start) =
            read_line(data, cursor).ok_or_else(|| DecodeError::MalformedItemHeader {
                index,
                reason: "item header is not terminated by a line break".to_string(),
            })?;
        let item_header = parse_item_header(line, index)?;

        let available = (data.len() - payload_start) as u64;
        let declared = item_header.length;
        if declared > available {
            return Err(DecodeError::TruncatedPayload {
                index,
                declared,
                available,
                missing: declared - available,
            });
        }

        // declared <= available, which fits in usize
        let payload_end = payload_start + declared as usize;
        let payload = data[payload_start..payload_end].to_vec();
        items.push(EnvelopeItem::from_decoded(item_header, payload));

        cursor = payload_end;
        if data.get(cursor) == Some(&b'\n') {
            cursor += 1;
        }
    }

    let envelope = Envelope::new(header, items);
    check_id_policy(&envelope, policy)?;
    Ok(envelope)
}

/// Apply `policy` to an envelope that is already in memory.
///
/// Writers use this to refuse envelopes a later `decode_with` would reject.
pub fn check_id_policy(envelope: &Envelope, policy: IdPolicy) -> Result<(), DecodeError> {
    if envelope.event_id().is_some() {
        return Ok(());
    }
    let required = match policy {
        IdPolicy::Required => true,
        IdPolicy::Optional => false,
        IdPolicy::Infer => ID_BEARING_ITEM_TYPES
            .iter()
            .any(|t| envelope.contains_item_type(t)),
    };
    if required {
        return Err(DecodeError::MissingRequiredField("event_id"));
    }
    Ok(())
}

/// `extra` members that collide with typed fields would be written twice.
fn wire_header(header: &EnvelopeHeader) -> Cow<'_, EnvelopeHeader> {
    if !RESERVED_HEADER_KEYS.iter().any(|k| header.extra.contains_key(*k)) {
        return Cow::Borrowed(header);
    }
    let mut header = header.clone();
    for key in RESERVED_HEADER_KEYS {
        header.extra.remove(key);
    }
    Cow::Owned(header)
}

fn wire_item_header(header: &ItemHeader) -> Cow<'_, ItemHeader> {
    if !RESERVED_ITEM_KEYS.iter().any(|k| header.extra.contains_key(*k)) {
        return Cow::Borrowed(header);
    }
    let mut header = header.clone();
    for key in RESERVED_ITEM_KEYS {
        header.extra.remove(key);
    }
    Cow::Owned(header)
}

/// Read the line starting at `start`.
///
/// Returns the line without its terminator (a trailing `\r` is dropped) and
/// the offset just past the `\n`, or `None` if no `\n` follows.
fn read_line(data: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = &data[start..];
    let newline = rest.iter().position(|&b| b == b'\n')?;
    let mut line = &rest[..newline];
    if let Some((&b'\r', head)) = line.split_last() {
        line = head;
    }
    Some((line, start + newline + 1))
}

fn only_line_breaks(rest: &[u8]) -> bool {
    rest.iter().all(|&b| b == b'\n' || b == b'\r')
}

fn parse_item_header(line: &[u8], index: usize) -> Result<ItemHeader, DecodeError> {
    let malformed = |reason: String| DecodeError::MalformedItemHeader { index, reason };

    if line.is_empty() {
        return Err(malformed("item header line is empty".to_string()));
    }

    let mut fields: Map<String, Value> = match serde_json::from_slice(line) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(malformed("item header is not a JSON object".to_string())),
        Err(e) => return Err(malformed(e.to_string())),
    };

    let item_type = match fields.remove("type") {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(_) => return Err(malformed("`type` must be a non-empty string".to_string())),
        None => return Err(malformed("missing `type`".to_string())),
    };

    let length = match fields.remove("length") {
        Some(value) => parse_length(&value)
            .ok_or_else(|| malformed(format!("`length` is not a non-negative integer: {value}")))?,
        None => return Err(malformed("missing `length`".to_string())),
    };

    let content_type = take_optional_string(&mut fields, "content_type", index)?;
    let file_name = take_optional_string(&mut fields, "filename", index)?;

    Ok(ItemHeader {
        item_type,
        length,
        content_type,
        file_name,
        extra: fields,
    })
}

/// Lengths are decimal: a JSON integer, or a string of ASCII digits.
fn parse_length(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse().ok()
        }
        _ => None,
    }
}

fn take_optional_string(
    fields: &mut Map<String, Value>,
    key: &str,
    index: usize,
) -> Result<Option<String>, DecodeError> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(DecodeError::MalformedItemHeader {
            index,
            reason: format!("`{key}` must be a string"),
        }),
    }
}
