//! Persistence seams.
//!
//! Every write is an atomic insert-or-update keyed by a stable unique field,
//! so resubmitting the same rule, view or content never duplicates rows and
//! concurrent writers on one key leave exactly one row behind.

pub mod schema;
pub mod sqlite;

use std::fmt::{self, Debug};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ExternalServiceError, IntegrityError, StepError};

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Rule {
    pub id: i64,
    pub rule_code: String,
    pub name: String,
    pub description: String,
    pub sql: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ViewRegistryEntry {
    pub id: i64,
    pub table_name: String,
    pub rule_id: i64,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row counts touched by one content upsert (or held by the store).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ContentSummary {
    pub posts: usize,
    pub organizations: usize,
    pub guests: usize,
    pub patterns: usize,
    pub links: usize,
    /// Links that did not exist before this upsert.
    pub links_added: usize,
}

impl fmt::Display for ContentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} posts, {} organizations, {} guests, {} patterns, {} links ({} new)",
            self.posts, self.organizations, self.guests, self.patterns, self.links, self.links_added
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Integrity(e) => StepError::Integrity(e),
            StoreError::InvalidInput(msg) => StepError::InvalidInput(msg),
            StoreError::Database(msg) => StepError::External(ExternalServiceError::Database(msg)),
        }
    }
}

/// Registry of compiled rules and the views materialized from them.
#[async_trait]
pub trait RegistryStore: Send + Sync + Debug {
    /// Insert by `rule_code`, or update every mutable field in place. Returns the stable id.
    async fn upsert_rule(&self, rule_code: &str, name: &str, description: &str, sql: &str) -> Result<i64, StoreError>;

    /// Insert by `table_name`, or update `rule_id`/`summary` keeping id and creation time.
    async fn upsert_view(&self, table_name: &str, rule_id: i64, summary: &str) -> Result<i64, StoreError>;

    async fn rule_by_code(&self, rule_code: &str) -> Result<Option<Rule>, StoreError>;

    async fn view_by_table(&self, table_name: &str) -> Result<Option<ViewRegistryEntry>, StoreError>;

    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError>;

    async fn list_views(&self) -> Result<Vec<ViewRegistryEntry>, StoreError>;
}

/// Executes generated SQL by (re)creating a named view over it.
#[async_trait]
pub trait ViewStore: Send + Sync + Debug {
    /// Replace view `table_name` with `sql` and return its row count.
    async fn materialize_view(&self, table_name: &str, sql: &str) -> Result<u64, StoreError>;

    /// Drop view `table_name`. Returns whether it existed.
    async fn drop_view(&self, table_name: &str) -> Result<bool, StoreError>;
}

/// Entity store fed by verified extractions.
#[async_trait]
pub trait ContentStore: Send + Sync + Debug {
    /// One idempotent upsert of a serialized `ExtractedEntityPayload`.
    async fn upsert_content(&self, document: &str) -> Result<ContentSummary, StoreError>;

    async fn content_counts(&self) -> Result<ContentSummary, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_step_errors() {
        let integrity: StepError = StoreError::Integrity(IntegrityError::UniqueViolation("x".into())).into();
        assert!(matches!(integrity, StepError::Integrity(_)));

        let db: StepError = StoreError::Database("locked".into()).into();
        assert!(matches!(db, StepError::External(ExternalServiceError::Database(_))));
    }

    #[test]
    fn test_summary_display() {
        let s = ContentSummary { posts: 1, patterns: 2, links: 3, links_added: 1, ..Default::default() };
        assert_eq!(s.to_string(), "1 posts, 0 organizations, 0 guests, 2 patterns, 3 links (1 new)");
    }
}
