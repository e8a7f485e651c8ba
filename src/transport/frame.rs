// src/transport/frame.rs
// The unit a transport moves: a message plus the metadata stamped at send time

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{TransportError, TransportResult};
use crate::message::Message;

/// AMQP field-table keys are short strings.
const MAX_HEADER_KEY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Frame {
    /// Frames an outbound message, rejecting anything a broker could not carry.
    pub fn from_message(message: &Message, max_frame_size: usize) -> TransportResult<Self> {
        for key in message.headers.keys() {
            validate_header_key(key)?;
        }

        let size = message.payload.len()
            + message
                .headers
                .iter()
                .map(|(key, value)| key.len() + value.len())
                .sum::<usize>();
        if size > max_frame_size {
            return Err(TransportError::Codec(format!(
                "frame of {} bytes exceeds the {} byte limit",
                size, max_frame_size
            )));
        }

        Ok(Frame {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            headers: message
                .headers
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            body: message.payload.clone(),
        })
    }

    pub fn into_message(self) -> Message {
        Message {
            headers: self.headers.into_iter().collect(),
            payload: self.body,
            message_id: Some(self.message_id.to_string()),
            timestamp: Some(self.timestamp),
        }
    }

    /// Wire encoding used by in-process transports.
    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn validate_header_key(key: &str) -> TransportResult<()> {
    if key.is_empty() {
        return Err(TransportError::Codec("header key must not be empty".to_string()));
    }
    if key.len() > MAX_HEADER_KEY_LEN {
        return Err(TransportError::Codec(format!(
            "header key '{}...' is longer than {} bytes",
            &key[..key.char_indices().nth(16).map_or(key.len(), |(i, _)| i)],
            MAX_HEADER_KEY_LEN
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(TransportError::Codec(format!(
            "header key {:?} contains control characters",
            key
        )));
    }
    Ok(())
}
