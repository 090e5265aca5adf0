//! Source connectors.
//!
//! A connector turns one external source into pages of `RawEvent`s. It must
//! be safe to call `poll` again with the same cursor: the pipeline only
//! advances the stored cursor after a whole page is committed, so a crash
//! replays the page and the normalizer drops what was already handled.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PipelineError;
use crate::normalizer::RawEvent;

pub mod adaptive;
pub mod jsonl;

pub use adaptive::{AdaptiveInterval, CircuitBreaker};
pub use jsonl::JsonLinesConnector;

/// One page from a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResult {
    pub events: Vec<RawEvent>,
    /// Cursor to store once every event in the page is committed.
    pub next_cursor: Option<String>,
}

impl PollResult {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn source_id(&self) -> &str;

    /// Events after `cursor` (from the start when `None`).
    async fn poll(&self, cursor: Option<&str>) -> Result<PollResult, PipelineError>;
}

/// `poll` bounded by a timeout. A timeout is a retryable error.
pub async fn poll_with_timeout(
    connector: &dyn Connector,
    cursor: Option<&str>,
    timeout_secs: u64,
) -> Result<PollResult, PipelineError> {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), connector.poll(cursor)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::timeout(
            &format!("poll {}", connector.source_id()),
            timeout_secs,
        )),
    }
}

/// In-memory connector. The cursor is the index of the next event.
pub struct StaticConnector {
    source_id: String,
    events: Mutex<Vec<RawEvent>>,
    page_size: usize,
}

impl StaticConnector {
    pub fn new(source_id: &str, events: Vec<RawEvent>) -> Self {
        Self {
            source_id: source_id.to_string(),
            events: Mutex::new(events),
            page_size: 100,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Append events, as if the source produced more.
    pub fn push(&self, event: RawEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl Connector for StaticConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn poll(&self, cursor: Option<&str>) -> Result<PollResult, PipelineError> {
        let start = match cursor {
            Some(c) => c.parse::<usize>().map_err(|e| {
                PipelineError::Configuration(format!("{}: bad cursor '{}': {}", self.source_id, c, e))
            })?,
            None => 0,
        };
        let events = self.events.lock();
        let end = (start + self.page_size).min(events.len());
        if start >= end {
            return Ok(PollResult::default());
        }
        Ok(PollResult {
            events: events[start..end].to_vec(),
            next_cursor: Some(end.to_string()),
        })
    }
}
