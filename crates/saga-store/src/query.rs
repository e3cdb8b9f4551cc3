use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaRecord, SagaStatus};

/// Builder for filtering saga listings.
///
/// Every criterion is optional; an empty filter matches all sagas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SagaFilter {
    /// Filter by saga type.
    pub saga_type: Option<String>,

    /// Filter by status.
    pub status: Option<SagaStatus>,

    /// Sagas created at or after this timestamp.
    pub created_from: Option<DateTime<Utc>>,

    /// Sagas created at or before this timestamp.
    pub created_to: Option<DateTime<Utc>>,
}

impl SagaFilter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by saga type.
    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    /// Filters by status.
    pub fn status(mut self, status: SagaStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filters to sagas created within `[from, to]`.
    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_to = Some(to);
        self
    }

    /// Returns true if the record satisfies every criterion.
    pub fn matches(&self, record: &SagaRecord) -> bool {
        if let Some(ref saga_type) = self.saga_type
            && &record.saga_type != saga_type
        {
            return false;
        }
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if let Some(from) = self.created_from
            && record.created_at < from
        {
            return false;
        }
        if let Some(to) = self.created_to
            && record.created_at > to
        {
            return false;
        }
        true
    }
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    /// Largest page a caller may request.
    pub const MAX_LIMIT: usize = 500;

    /// Creates a page request; `limit` is clamped to `1..=MAX_LIMIT`.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    /// The first page of the given size.
    pub fn first(limit: usize) -> Self {
        Self::new(0, limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(50)
    }
}

/// One page of results plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: usize,
    pub limit: usize,
}

impl<T> Page<T> {
    /// Returns true if more results exist past this page.
    pub fn has_more(&self) -> bool {
        (self.offset + self.items.len()) < self.total as usize
    }
}
