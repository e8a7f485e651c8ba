// src/messaging/destination.rs

use std::fmt;

use super::errors::{MessengerError, Result};

const MAX_DESTINATION_LEN: usize = 255;

/// A queue name that any supported broker can address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination(String);

impl Destination {
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(MessengerError::Destination("destination name is empty".to_string()));
        }
        if name.len() > MAX_DESTINATION_LEN {
            return Err(MessengerError::Destination(format!(
                "destination name is {} bytes, the limit is {}",
                name.len(),
                MAX_DESTINATION_LEN
            )));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(MessengerError::Destination(format!(
                "destination name {:?} contains whitespace or control characters",
                name
            )));
        }
        Ok(Destination(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
