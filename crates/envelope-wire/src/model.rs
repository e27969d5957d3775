//! In-memory envelope representation.

use crate::category::DataCategory;
use crate::error::{WireError, WireResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Envelope header members with a typed field of their own.
pub(crate) const RESERVED_HEADER_KEYS: [&str; 3] = ["event_id", "sdk", "sent_at"];

/// Item header members with a typed field of their own.
pub(crate) const RESERVED_ITEM_KEYS: [&str; 4] = ["type", "length", "content_type", "filename"];

/// A package bundled into the SDK that produced the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkPackage {
    pub name: String,
    pub version: String,
}

/// Identity of the SDK that produced the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integrations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<SdkPackage>,
}

impl SdkInfo {
    /// Create SDK info with no integrations or packages.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            integrations: Vec::new(),
            packages: Vec::new(),
        }
    }
}

/// Envelope header record (first line on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Correlation id of the unit of work this envelope carries.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "event_id_format"
    )]
    pub event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Header members this crate does not interpret, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EnvelopeHeader {
    /// Header carrying only a correlation id.
    pub fn with_event_id(event_id: Uuid) -> Self {
        Self {
            event_id: Some(event_id),
            ..Default::default()
        }
    }
}

/// Item header record (first line of every item).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemHeader {
    #[serde(rename = "type")]
    pub item_type: String,
    pub length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "filename", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Type-specific members (e.g. `attachment_type`), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One typed item. `header.length == payload.len()` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeItem {
    header: ItemHeader,
    payload: Vec<u8>,
}

impl EnvelopeItem {
    /// Create an item of `item_type` around `payload`.
    pub fn new(item_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            header: ItemHeader {
                item_type: item_type.into(),
                length: payload.len() as u64,
                content_type: None,
                file_name: None,
                extra: Map::new(),
            },
            payload,
        }
    }

    /// A JSON `event` item.
    pub fn event(payload: impl Into<Vec<u8>>) -> Self {
        Self::new("event", payload).with_content_type("application/json")
    }

    /// A JSON `session` item.
    pub fn session(payload: impl Into<Vec<u8>>) -> Self {
        Self::new("session", payload).with_content_type("application/json")
    }

    /// A binary `attachment` item.
    pub fn attachment(file_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new("attachment", payload).with_file_name(file_name)
    }

    /// Rebuild an item from a header and payload, checking the length.
    pub fn from_parts(header: ItemHeader, payload: Vec<u8>) -> WireResult<Self> {
        if header.length != payload.len() as u64 {
            return Err(WireError::LengthMismatch {
                declared: header.length,
                actual: payload.len() as u64,
            });
        }
        Ok(Self { header, payload })
    }

    /// Decoder-side constructor; the codec has already checked the length.
    pub(crate) fn from_decoded(header: ItemHeader, payload: Vec<u8>) -> Self {
        debug_assert_eq!(header.length, payload.len() as u64);
        Self { header, payload }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.header.content_type = Some(content_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.header.file_name = Some(file_name.into());
        self
    }

    /// Attach a type-specific header member.
    ///
    /// Keys owned by typed fields (`type`, `length`, `content_type`,
    /// `filename`) are ignored; use the dedicated setters.
    pub fn with_header_field(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if !RESERVED_ITEM_KEYS.contains(&key.as_str()) {
            self.header.extra.insert(key, value);
        }
        self
    }

    pub fn header(&self) -> &ItemHeader {
        &self.header
    }

    pub fn item_type(&self) -> &str {
        &self.header.item_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Rate-limit category for this item.
    pub fn category(&self) -> DataCategory {
        DataCategory::from_item_type(&self.header.item_type)
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// A header plus an ordered sequence of items. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    header: EnvelopeHeader,
    items: Vec<EnvelopeItem>,
}

impl Envelope {
    pub fn new(header: EnvelopeHeader, items: Vec<EnvelopeItem>) -> Self {
        Self { header, items }
    }

    /// Envelope with a correlation id and a single item.
    pub fn from_item(event_id: Uuid, item: EnvelopeItem) -> Self {
        Self::new(EnvelopeHeader::with_event_id(event_id), vec![item])
    }

    /// Append an item, consuming the envelope.
    pub fn with_item(mut self, item: EnvelopeItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    pub fn event_id(&self) -> Option<Uuid> {
        self.header.event_id
    }

    pub fn items(&self) -> &[EnvelopeItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the envelope carries an item of `item_type`.
    pub fn contains_item_type(&self, item_type: &str) -> bool {
        self.items.iter().any(|item| item.item_type() == item_type)
    }

    pub fn into_parts(self) -> (EnvelopeHeader, Vec<EnvelopeItem>) {
        (self.header, self.items)
    }
}

/// Event ids are written as 32 hex chars without dashes; both forms are read.
mod event_id_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S>(value: &Option<Uuid>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(id) => serializer.serialize_str(&id.simple().to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => Uuid::parse_str(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
