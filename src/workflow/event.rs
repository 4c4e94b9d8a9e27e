//! Events signal system state change.
//!
//! Events are posted to job inputs.  A job input is a bucket of tokens
//! representing one class of events, typically completions of a specific
//! upstream job.  A job may run once every input holds at least one event;
//! the events that let it run are its triggering events and are consumed
//! when the execution completes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Payload of an event token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Identity of the actor that posted the event.
    pub creator: String,

    /// Attributes exported by the upstream execution, consumed by
    /// downstream job commands.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl EventRecord {
    pub fn new(creator: &str) -> Self {
        Self {
            creator: creator.to_string(),
            attributes: HashMap::new(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("event record serialization cannot fail")
    }
}

/// Merge attributes from a set of triggering events.
///
/// If several events carry the same attribute, the values are joined with
/// commas so none of them is silently dropped.
pub fn consolidate_attributes(events: &[EventRecord]) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = HashMap::new();
    for event in events {
        for (key, value) in &event.attributes {
            merged
                .entry(key.clone())
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
    }
    merged
}
