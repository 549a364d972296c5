use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::rules::actions::apply_match;
use crate::rules::context::RuleEvaluationContext;
use crate::rules::selector::{CompiledRule, RuleSet};
use crate::rules::types::RuleMatch;

use super::repository::{JobProgress, JobRecordError};
use super::scope::{ContainerScope, ItemRef, JobProgressStore, RuleTargetStore, StoreError};

/// What a job evaluates against every message in scope.
#[derive(Debug, Clone)]
pub enum ApplicationPlan {
    /// One rule's tree evaluated directly. Enabled flag and scoping were settled
    /// when the job was started.
    SingleRule(Box<CompiledRule>),
    /// First-match-wins over the rules loaded at job start.
    AllRules(RuleSet),
}

impl ApplicationPlan {
    pub fn mode(&self) -> &'static str {
        match self {
            ApplicationPlan::SingleRule(_) => "single_rule",
            ApplicationPlan::AllRules(_) => "all_rules",
        }
    }

    pub fn tracks_breakdown(&self) -> bool {
        matches!(self, ApplicationPlan::AllRules(_))
    }

    fn evaluate(&self, ctx: &RuleEvaluationContext, item: &ItemRef) -> Option<RuleMatch> {
        match self {
            ApplicationPlan::SingleRule(rule) => rule.matches(ctx).then(|| rule.to_match()),
            ApplicationPlan::AllRules(rules) => rules.select(ctx, Some(item.container_id)),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to read page: {0}")]
    Store(#[from] StoreError),
    #[error("failed to record progress: {0}")]
    Progress(#[from] JobRecordError),
}

/// Pages through a scope, applying the plan's winning actions and recording
/// progress after every page.
#[derive(Clone)]
pub struct BatchRunner {
    store: Arc<dyn RuleTargetStore>,
    progress: Arc<dyn JobProgressStore>,
    page_size: u32,
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn RuleTargetStore>,
        progress: Arc<dyn JobProgressStore>,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            progress,
            page_size: page_size.max(1),
        }
    }

    /// Drive a job to completion or failure. Never returns an error; the outcome
    /// lands in the job record.
    pub async fn run_job(&self, job_id: String, scope: ContainerScope, plan: ApplicationPlan) {
        let span = info_span!("rule_application", job_id = %job_id, mode = plan.mode());
        async {
            let result = AssertUnwindSafe(self.run(&job_id, &scope, &plan))
                .catch_unwind()
                .await;

            let message = match result {
                Ok(Ok(progress)) => {
                    info!(
                        processed = progress.processed_count,
                        matched = progress.matched_count,
                        "rule application completed"
                    );
                    return;
                }
                Ok(Err(err)) => err.to_string(),
                Err(panic) => panic_message(panic),
            };

            error!(error = %message, "rule application failed");
            if let Err(err) = self.progress.fail(&job_id, &message).await {
                error!(error = %err, "failed to record job failure");
            }
        }
        .instrument(span)
        .await
    }

    /// The paging loop. Errors here are fatal to the job; per-item errors are not.
    pub async fn run(
        &self,
        job_id: &str,
        scope: &ContainerScope,
        plan: &ApplicationPlan,
    ) -> Result<JobProgress, BatchError> {
        let mut progress = JobProgress::new(plan.tracks_breakdown());
        let mut cursor = None;

        loop {
            tokio::task::yield_now().await;
            let page = self
                .store
                .page_in_scope(scope, self.page_size, cursor)
                .await?;

            for item in &page {
                self.process_item(item, plan, &mut progress).await;
            }

            if let Some(last) = page.last() {
                cursor = Some(last.message_id);
                self.progress.update_progress(job_id, &progress).await?;
                debug!(processed = progress.processed_count, "page recorded");
                tokio::task::yield_now().await;
            }

            if page.len() < self.page_size as usize {
                self.progress.complete(job_id, &progress).await?;
                return Ok(progress);
            }
        }
    }

    async fn process_item(&self, item: &ItemRef, plan: &ApplicationPlan, progress: &mut JobProgress) {
        progress.processed_count += 1;

        let ctx = match self.store.build_context(item).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => {
                debug!(message_id = item.message_id, "message vanished before evaluation");
                return;
            }
            Err(err) => {
                warn!(message_id = item.message_id, error = %err, "failed to build evaluation context");
                return;
            }
        };

        let Some(rule_match) = plan.evaluate(&ctx, item) else {
            return;
        };

        match apply_match(self.store.as_ref(), item, &rule_match).await {
            Ok(action) => {
                debug!(
                    message_id = item.message_id,
                    rule_id = %rule_match.rule_id,
                    ?action,
                    "rule applied"
                );
                progress.record_match(&rule_match.rule_id);
            }
            Err(err) => {
                warn!(
                    message_id = item.message_id,
                    rule_id = %rule_match.rule_id,
                    error = %err,
                    "failed to apply rule action"
                );
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "rule application panicked".to_string()
    }
}
