use chrono::{DateTime, Local};
use std::fmt;

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    topic: String,
    payload: String,
    timestamp: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(40).collect();
        write!(f, "{} - {}: {}", self.timestamp.format("%H:%M:%S"), self.topic, preview)
    }
}

impl InboundMessage {
    /// Payload bytes are decoded as UTF-8, replacing invalid sequences.
    pub fn from_publish(topic: &str, payload: &[u8]) -> Self {
        Self {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            timestamp: Local::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn segments(&self) -> Vec<&str> {
        self.topic.split('/').collect()
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }
}
