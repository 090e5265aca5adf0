//! File-backed connector: one event per line of a `.jsonl` file.
//!
//! The cursor is the number of lines already consumed. Lines that are not
//! valid events are logged and skipped; the cursor still moves past them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{Connector, PollResult};
use crate::error::PipelineError;
use crate::normalizer::RawEvent;

const DEFAULT_PAGE_SIZE: usize = 200;

/// A line in the file. `sourceId` is optional: the connector's id wins.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineEvent {
    external_id: String,
    timestamp: DateTime<Utc>,
    payload: Value,
}

pub struct JsonLinesConnector {
    source_id: String,
    path: PathBuf,
    page_size: usize,
}

impl JsonLinesConnector {
    pub fn new(source_id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.to_string(),
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Connector for JsonLinesConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn poll(&self, cursor: Option<&str>) -> Result<PollResult, PipelineError> {
        let offset = match cursor {
            Some(c) => c.trim().parse::<usize>().map_err(|e| {
                PipelineError::Configuration(format!(
                    "{}: bad line cursor '{}': {}",
                    self.source_id, c, e
                ))
            })?,
            None => 0,
        };

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            // Nothing written yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PollResult::default())
            }
            Err(e) => {
                return Err(PipelineError::TransientSource {
                    source_id: self.source_id.clone(),
                    message: format!("read {}: {}", self.path.display(), e),
                })
            }
        };

        // A trailing line without newline may still be being written.
        let complete = match content.rfind('\n') {
            Some(end) => &content[..=end],
            None => "",
        };

        let mut events = Vec::new();
        let mut consumed = offset;
        for (index, line) in complete.lines().enumerate().skip(offset).take(self.page_size) {
            consumed = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LineEvent>(line) {
                Ok(parsed) => events.push(RawEvent {
                    source_id: self.source_id.clone(),
                    external_id: parsed.external_id,
                    timestamp: parsed.timestamp,
                    payload: parsed.payload,
                    cursor: consumed.to_string(),
                }),
                Err(e) => log::warn!(
                    "Connector: {} line {} is not an event, skipping: {}",
                    self.source_id,
                    consumed,
                    e
                ),
            }
        }

        if consumed == offset {
            return Ok(PollResult::default());
        }
        Ok(PollResult {
            events,
            next_cursor: Some(consumed.to_string()),
        })
    }
}
