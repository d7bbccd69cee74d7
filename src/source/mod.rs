//! Snapshot sources: the workflow engines being polled.

pub mod airflow;
pub mod argo;

use crate::error::Result;
use crate::model::{EntitySnapshot, SourceType, SubRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::time::Duration;

/// Trailing window of activity a fetch should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub since: DateTime<Utc>,
}

impl TimeWindow {
    /// The window ending now and reaching `width` into the past.
    pub fn trailing(width: Duration) -> Self {
        let width = chrono::Duration::from_std(width).unwrap_or(chrono::Duration::MAX);
        Self {
            since: Utc::now()
                .checked_sub_signed(width)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn contains(&self, t: Option<DateTime<Utc>>) -> bool {
        t.is_some_and(|t| t > self.since)
    }
}

/// Drops known-noisy entities by name.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    pattern: Option<Regex>,
}

impl ExclusionFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern: Some(pattern),
        }
    }

    pub fn excludes(&self, name: &str) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.is_match(name))
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Fetch every entity with activity inside `window`. Entities the filter
    /// excludes may be skipped early to save upstream calls.
    async fn fetch(
        &self,
        window: &TimeWindow,
        filter: &ExclusionFilter,
    ) -> Result<Vec<EntitySnapshot>>;

    /// Child records for a snapshot about to be traced. Sources that need a
    /// second round trip for children override this; the default returns
    /// what the list call already carried.
    async fn sub_records(&self, snapshot: &EntitySnapshot) -> Result<Vec<SubRecord>> {
        Ok(snapshot.sub_records.clone())
    }
}
