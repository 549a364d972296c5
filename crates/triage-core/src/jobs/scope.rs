use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::MessageError;
use crate::rules::actions::RuleAction;
use crate::rules::context::RuleEvaluationContext;

use super::repository::{JobProgress, JobRecordError};

/// A message as seen by the paging loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub message_id: i64,
    pub conversation_id: Option<i64>,
    pub container_id: i64,
}

/// Which containers a scan covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ContainerScope {
    #[default]
    All,
    Containers(Vec<i64>),
}

impl ContainerScope {
    /// An empty id list means every container.
    pub fn from_ids(ids: Vec<i64>) -> Self {
        if ids.is_empty() {
            ContainerScope::All
        } else {
            ContainerScope::Containers(ids)
        }
    }

    pub fn container_ids(&self) -> Option<&[i64]> {
        match self {
            ContainerScope::All => None,
            ContainerScope::Containers(ids) => Some(ids),
        }
    }

    pub fn contains(&self, container_id: i64) -> bool {
        match self {
            ContainerScope::All => true,
            ContainerScope::Containers(ids) => ids.contains(&container_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store error: {0}")]
    Message(#[from] MessageError),
    #[error("{0}")]
    Backend(String),
}

/// Storage collaborator consumed by the batch scheduler, the preview evaluator and
/// single-message classification.
#[async_trait]
pub trait RuleTargetStore: Send + Sync {
    async fn count_in_scope(&self, scope: &ContainerScope) -> Result<i64, StoreError>;

    /// Up to `page_size` items with a message id greater than `after`, ascending.
    async fn page_in_scope(
        &self,
        scope: &ContainerScope,
        page_size: u32,
        after: Option<i64>,
    ) -> Result<Vec<ItemRef>, StoreError>;

    /// `None` when the message vanished between paging and evaluation.
    async fn build_context(
        &self,
        item: &ItemRef,
    ) -> Result<Option<RuleEvaluationContext>, StoreError>;

    /// Must be idempotent: applying the same action twice equals applying it once.
    async fn apply_action(&self, item: &ItemRef, action: &RuleAction) -> Result<(), StoreError>;

    async fn find_item(&self, message_id: i64) -> Result<Option<ItemRef>, StoreError>;
}

/// Progress half of the job record, written only by the job's own run.
#[async_trait]
pub trait JobProgressStore: Send + Sync {
    async fn update_progress(
        &self,
        job_id: &str,
        progress: &JobProgress,
    ) -> Result<(), JobRecordError>;

    async fn complete(&self, job_id: &str, progress: &JobProgress) -> Result<(), JobRecordError>;

    async fn fail(&self, job_id: &str, error: &str) -> Result<(), JobRecordError>;
}
