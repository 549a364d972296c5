use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::rules::conditions::{CompiledGroup, ConditionGroup};

use super::scope::{ContainerScope, RuleTargetStore, StoreError};

/// A message a draft rule would match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewMatch {
    pub message_id: i64,
    pub conversation_id: Option<i64>,
    pub container_id: i64,
    pub subject: Option<String>,
    pub sender_email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOutcome {
    pub matches: Vec<PreviewMatch>,
    pub scanned_count: u32,
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("failed to read page: {0}")]
    Store(#[from] StoreError),
}

/// Read-only dry run of a condition tree over a bounded slice of the scope.
#[derive(Clone)]
pub struct PreviewEvaluator {
    store: Arc<dyn RuleTargetStore>,
    page_size: u32,
}

impl PreviewEvaluator {
    pub fn new(store: Arc<dyn RuleTargetStore>, page_size: u32) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Stops once `scan_cap` messages were scanned or `match_cap` matched,
    /// whichever comes first. Nothing is mutated.
    pub async fn preview(
        &self,
        conditions: &ConditionGroup,
        scope: &ContainerScope,
        scan_cap: u32,
        match_cap: u32,
    ) -> Result<PreviewOutcome, PreviewError> {
        let compiled = CompiledGroup::compile(conditions);
        let mut outcome = PreviewOutcome::default();
        let mut cursor = None;

        while outcome.scanned_count < scan_cap && (outcome.matches.len() as u32) < match_cap {
            let remaining = scan_cap - outcome.scanned_count;
            let page_size = self.page_size.min(remaining);
            let page = self.store.page_in_scope(scope, page_size, cursor).await?;

            for item in &page {
                if outcome.matches.len() as u32 >= match_cap {
                    break;
                }
                outcome.scanned_count += 1;

                let ctx = match self.store.build_context(item).await {
                    Ok(Some(ctx)) => ctx,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(message_id = item.message_id, error = %err, "preview skipped message");
                        continue;
                    }
                };

                if compiled.evaluate(&ctx) {
                    outcome.matches.push(PreviewMatch {
                        message_id: item.message_id,
                        conversation_id: item.conversation_id,
                        container_id: item.container_id,
                        subject: ctx.subject,
                        sender_email: ctx.sender_email,
                    });
                }
            }

            if page.len() < page_size as usize {
                break;
            }
            cursor = page.last().map(|item| item.message_id);
        }

        debug!(
            scanned = outcome.scanned_count,
            matched = outcome.matches.len(),
            "preview finished"
        );
        Ok(outcome)
    }
}
