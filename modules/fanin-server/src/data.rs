//! Shapes of the `data` carried by barrier events.

use std::sync::Arc;

use fanin_store::{Combine, Concat, Contribution, MergePayload};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cloudevent::{CloudEvent, EventError};

/// `{ "id": 1, "message": "..." }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub id: i64,
    pub message: String,
}

/// `{ "id": 1, "payload": { "<stage>": ... } }`, one key per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadData {
    pub id: i64,
    pub payload: Map<String, Value>,
}

/// Which data shape the aggregator accepts and how it merges it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeMode {
    #[default]
    Message,
    Payload,
}

impl MergeMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "message" => Some(MergeMode::Message),
            "payload" => Some(MergeMode::Payload),
            _ => None,
        }
    }

    pub fn combine(&self, separator: &str) -> Arc<dyn Combine> {
        match self {
            MergeMode::Message => Arc::new(Concat::new(separator)),
            MergeMode::Payload => Arc::new(MergePayload),
        }
    }

    /// Validate the event's data and turn it into a contribution keyed by the
    /// event's `(source, id)`.
    pub fn decode(&self, event: &CloudEvent) -> Result<Contribution, EventError> {
        let payload = match self {
            MergeMode::Message => to_value(event.data_as::<MessageData>()?)?,
            MergeMode::Payload => to_value(event.data_as::<PayloadData>()?)?,
        };
        Ok(Contribution::new(payload).with_key(format!("{}/{}", event.source, event.id)))
    }
}

fn to_value<T: Serialize>(data: T) -> Result<Value, EventError> {
    serde_json::to_value(data).map_err(EventError::Data)
}
