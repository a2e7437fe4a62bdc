//! Persistence collaborator interface.
//!
//! The streaming core only needs to hand finished records to whatever store
//! the deployment wires in; it makes no transactional demands. Keeping this
//! behind a trait lets tests and standalone runs use `NullStore`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub repo_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub project_id: String,
    pub role: String,
    pub content: String,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn assistant(project_id: &str, content: String, duration_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            role: "assistant".to_string(),
            content,
            duration_ms: Some(duration_ms),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn find_project(&self, id: &str) -> Result<Option<ProjectRecord>>;

    async fn create_message(&self, record: MessageRecord) -> Result<MessageRecord>;

    async fn update_request_status(
        &self,
        request_id: &str,
        status: &str,
        extra: Option<Value>,
    ) -> Result<()>;
}

/// Store used when no persistence backend is wired in.
pub struct NullStore;

#[async_trait]
impl ProjectStore for NullStore {
    async fn find_project(&self, _id: &str) -> Result<Option<ProjectRecord>> {
        Ok(None)
    }

    async fn create_message(&self, record: MessageRecord) -> Result<MessageRecord> {
        Ok(record)
    }

    async fn update_request_status(
        &self,
        _request_id: &str,
        _status: &str,
        _extra: Option<Value>,
    ) -> Result<()> {
        Ok(())
    }
}
