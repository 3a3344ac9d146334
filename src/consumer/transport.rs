use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::HivewatchError;

/// Header carrying the number of earlier delivery attempts.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Header set on dead-lettered messages.
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

/// One message as handed out by a transport. `tag` is transport-local and
/// identifies the message for ack/requeue/dead-letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Prior attempts, 0 on first delivery.
    pub attempts: u32,
}

impl Delivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Parse the prior-attempt count from headers. Missing or garbled means 0.
    pub fn attempts_from_headers(headers: &BTreeMap<String, String>) -> u32 {
        headers
            .get(RETRY_COUNT_HEADER)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Message broker seen by the consumer loop. Receives one message at a time;
/// every received message must be settled with exactly one of ack, requeue or
/// dead_letter before the next receive.
#[async_trait]
pub trait FrameTransport: Send {
    async fn connect(&mut self) -> Result<(), HivewatchError>;

    /// `Ok(None)` when nothing arrived within the poll interval.
    async fn receive(&mut self) -> Result<Option<Delivery>, HivewatchError>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), HivewatchError>;

    /// Put the message back for another attempt, with `attempts + 1`.
    async fn requeue(&mut self, delivery: &Delivery) -> Result<(), HivewatchError>;

    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str)
        -> Result<(), HivewatchError>;

    async fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_from_headers() {
        let mut headers = BTreeMap::new();
        assert_eq!(Delivery::attempts_from_headers(&headers), 0);

        headers.insert(RETRY_COUNT_HEADER.to_string(), "2".to_string());
        assert_eq!(Delivery::attempts_from_headers(&headers), 2);

        headers.insert(RETRY_COUNT_HEADER.to_string(), "two".to_string());
        assert_eq!(Delivery::attempts_from_headers(&headers), 0);
    }
}
