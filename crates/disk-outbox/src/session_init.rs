//! Keeps a session's `init` flag alive when its first envelope is evicted.
//!
//! The server only learns a session started from the update carrying
//! `"init": true`. If that envelope is evicted, the flag moves to the next
//! queued update of the same session.

use envelope_wire::{Envelope, EnvelopeItem};
use serde_json::{Map, Value};

const SESSION_ITEM_TYPE: &str = "session";

/// What a surviving envelope means for a session whose start was evicted.
#[derive(Debug, PartialEq)]
pub(crate) enum InitTransfer {
    /// The envelope has no update for this session.
    Unrelated,
    /// The session already has an `init` update; nothing to move.
    AlreadyInit,
    /// Rewritten copy carrying the flag.
    Moved(Envelope),
}

/// Session id of the first session item, if it opens the session.
pub(crate) fn initial_session_id(envelope: &Envelope) -> Option<String> {
    let item = envelope
        .items()
        .iter()
        .find(|item| item.item_type() == SESSION_ITEM_TYPE)?;
    let session = parse_session(item)?;
    let sid = valid_session_id(&session)?;
    (session.get("init") == Some(&Value::Bool(true))).then(|| sid.to_string())
}

/// Set `init` on the update of session `sid` carried by `envelope`.
pub(crate) fn transfer_init(envelope: &Envelope, sid: &str) -> InitTransfer {
    for (index, item) in envelope.items().iter().enumerate() {
        if item.item_type() != SESSION_ITEM_TYPE {
            continue;
        }
        let Some(mut session) = parse_session(item) else {
            continue;
        };
        if valid_session_id(&session).is_none() {
            continue;
        }
        if session.get("init") == Some(&Value::Bool(true)) {
            return InitTransfer::AlreadyInit;
        }
        if valid_session_id(&session) != Some(sid) {
            continue;
        }

        session.insert("init".to_string(), Value::Bool(true));
        let Ok(payload) = serde_json::to_vec(&session) else {
            return InitTransfer::Unrelated;
        };
        let mut header = item.header().clone();
        header.length = payload.len() as u64;
        let Ok(rewritten) = EnvelopeItem::from_parts(header, payload) else {
            return InitTransfer::Unrelated;
        };

        let (envelope_header, mut items) = envelope.clone().into_parts();
        items[index] = rewritten;
        return InitTransfer::Moved(Envelope::new(envelope_header, items));
    }
    InitTransfer::Unrelated
}

fn parse_session(item: &EnvelopeItem) -> Option<Map<String, Value>> {
    serde_json::from_slice(item.payload()).ok()
}

/// Only healthy sessions with an id take part.
fn valid_session_id(session: &Map<String, Value>) -> Option<&str> {
    if session.get("status").and_then(Value::as_str) != Some("ok") {
        return None;
    }
    session.get("sid").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn session(payload: &str) -> Envelope {
        Envelope::from_item(Uuid::new_v4(), EnvelopeItem::session(payload.as_bytes().to_vec()))
    }

    #[test]
    fn test_initial_session_id() {
        assert_eq!(
            initial_session_id(&session(r#"{"sid":"s1","status":"ok","init":true}"#)),
            Some("s1".to_string())
        );
        assert_eq!(
            initial_session_id(&session(r#"{"sid":"s1","status":"ok","init":false}"#)),
            None
        );
        assert_eq!(
            initial_session_id(&session(r#"{"sid":"s1","status":"exited","init":true}"#)),
            None
        );
        assert_eq!(initial_session_id(&session("not json")), None);
    }

    #[test]
    fn test_transfer_sets_flag_on_matching_session() {
        let later = session(r#"{"sid":"s1","status":"ok","seq":2}"#);
        let InitTransfer::Moved(rewritten) = transfer_init(&later, "s1") else {
            panic!("expected the flag to move");
        };

        let item = &rewritten.items()[0];
        assert_eq!(item.header().length, item.payload().len() as u64);
        let value: Map<String, Value> = serde_json::from_slice(item.payload()).unwrap();
        assert_eq!(value.get("init"), Some(&Value::Bool(true)));
        assert_eq!(value.get("seq"), Some(&Value::from(2)));
        assert_eq!(rewritten.event_id(), later.event_id());
    }

    #[test]
    fn test_transfer_ignores_other_sessions() {
        let other = session(r#"{"sid":"s2","status":"ok"}"#);
        assert_eq!(transfer_init(&other, "s1"), InitTransfer::Unrelated);
    }

    #[test]
    fn test_transfer_stops_at_existing_init() {
        let restarted = session(r#"{"sid":"s1","status":"ok","init":true}"#);
        assert_eq!(transfer_init(&restarted, "s1"), InitTransfer::AlreadyInit);
    }
}
