//! # Current State
//!
//! A record's current state is never stored. It is folded from the record's
//! full event history every time someone asks, so the ledger stays the only
//! source of truth.
//!
//! ```text
//!   add {owner: A, value: 100}           -> {owner: A, value: 100}
//!   transfer {new_owner: B}              -> {owner: B, value: 100}
//!   inherit {new_owner: C,
//!            new_property_value: 250}    -> {owner: C, value: 250}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::block::Block;

/// Payload keys that identify an event rather than describe the record.
const ENVELOPE_KEYS: [&str; 3] = ["type", "key", "property_key"];

/// Ownership-changing events and how their fields map onto the record.
const TRANSFER_FIELDS: [(&str, &str); 5] = [
    ("new_owner", "owner"),
    ("new_owner_customer_key", "customer_key"),
    ("new_owner_aadhar", "aadhar_no"),
    ("new_owner_pan", "pan_no"),
    ("new_property_value", "value"),
];

/// Latest view of one record, rebuilt from its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    pub key: String,
    pub fields: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub event_count: usize,
    pub total_transfers: usize,
    pub last_event_type: Option<String>,
}

impl CurrentState {
    /// Fold an ordered (oldest first) history into a view.
    ///
    /// Returns `None` for an empty history.
    pub fn fold<'a, I>(key: &str, history: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Block>,
    {
        let mut history = history.into_iter();
        let first = history.next()?;

        let mut state = CurrentState {
            key: key.to_string(),
            fields: Map::new(),
            registered_at: first.timestamp,
            last_updated: first.timestamp,
            event_count: 0,
            total_transfers: 0,
            last_event_type: None,
        };
        state.apply(first);
        for block in history {
            state.apply(block);
        }
        Some(state)
    }

    fn apply(&mut self, block: &Block) {
        self.event_count += 1;
        self.last_updated = block.timestamp;
        self.last_event_type = block.event_type().map(str::to_string);

        let Some(payload) = block.payload.as_object() else {
            return;
        };

        match block.event_type() {
            Some("transfer") | Some("inherit") => {
                self.total_transfers += 1;
                for (from, to) in TRANSFER_FIELDS {
                    match payload.get(from) {
                        Some(Value::Null) | None => {}
                        Some(value) => {
                            self.fields.insert(to.to_string(), value.clone());
                        }
                    }
                }
            }
            _ => {
                for (name, value) in payload {
                    if !ENVELOPE_KEYS.contains(&name.as_str()) {
                        self.fields.insert(name.clone(), value.clone());
                    }
                }
            }
        }
    }

    /// Field lookup shorthand.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn block(index: u64, payload: Value) -> Block {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(index as i64);
        Block {
            index,
            timestamp: ts,
            payload,
            previous_hash: String::new(),
            hash: String::new(),
            nonce: 0,
        }
    }

    #[test]
    fn empty_history_has_no_state() {
        assert!(CurrentState::fold("PROP-1", std::iter::empty()).is_none());
    }

    #[test]
    fn registration_seeds_fields() {
        let history = [block(
            1,
            json!({"type": "add", "key": "PROP-1", "owner": "Asha", "value": 100}),
        )];
        let state = CurrentState::fold("PROP-1", &history).unwrap();
        assert_eq!(state.get("owner"), Some(&json!("Asha")));
        assert_eq!(state.get("value"), Some(&json!(100)));
        assert!(state.get("type").is_none());
        assert!(state.get("key").is_none());
        assert_eq!(state.total_transfers, 0);
        assert_eq!(state.registered_at, state.last_updated);
    }

    #[test]
    fn transfers_rename_onto_record_fields() {
        let history = [
            block(1, json!({"type": "add", "key": "PROP-1", "owner": "Asha", "pan_no": "AAAAA1111A", "value": 100})),
            block(2, json!({"type": "transfer", "property_key": "PROP-1", "new_owner": "Bala", "new_owner_pan": "BBBBB2222B"})),
            block(3, json!({"type": "inherit", "property_key": "PROP-1", "new_owner": "Chitra", "new_property_value": 250})),
        ];
        let state = CurrentState::fold("PROP-1", &history).unwrap();
        assert_eq!(state.get("owner"), Some(&json!("Chitra")));
        assert_eq!(state.get("pan_no"), Some(&json!("BBBBB2222B")));
        assert_eq!(state.get("value"), Some(&json!(250)));
        assert!(state.get("new_owner").is_none());
        assert_eq!(state.total_transfers, 2);
        assert_eq!(state.event_count, 3);
        assert_eq!(state.last_event_type.as_deref(), Some("inherit"));
        assert_eq!(state.registered_at, history[0].timestamp);
        assert_eq!(state.last_updated, history[2].timestamp);
    }

    #[test]
    fn unknown_events_merge_shallowly() {
        let history = [
            block(1, json!({"type": "add", "key": "K", "address": {"city": "Mysuru"}})),
            block(2, json!({"type": "annotate", "key": "K", "note": "survey updated"})),
        ];
        let state = CurrentState::fold("K", &history).unwrap();
        assert_eq!(state.get("note"), Some(&json!("survey updated")));
        assert_eq!(state.get("address"), Some(&json!({"city": "Mysuru"})));
        assert_eq!(state.total_transfers, 0);
    }
}
