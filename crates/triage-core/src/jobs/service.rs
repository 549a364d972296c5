use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RulesConfig;
use crate::db::Database;
use crate::messages::MessageRepository;
use crate::rules::actions::{ActionError, apply_match};
use crate::rules::conditions::{ConditionError, ConditionGroup, validate_group};
use crate::rules::repositories::{RuleError, RuleRepository};
use crate::rules::selector::{CompiledRule, RuleSet};
use crate::rules::types::RuleMatch;

use super::preview::{PreviewError, PreviewEvaluator, PreviewOutcome};
use super::repository::{
    JobRecordError, NewRuleApplicationJob, RuleApplicationJob, RuleApplicationJobRepository,
};
use super::scheduler::{ApplicationPlan, BatchRunner};
use super::scope::{ContainerScope, RuleTargetStore, StoreError};

pub const INTERRUPTED_ERROR: &str = "interrupted: server restarted while the job was running";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Job(#[from] JobRecordError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Preview(#[from] PreviewError),
    #[error("invalid conditions: {0}")]
    InvalidConditions(#[from] ConditionError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("message not found: {0}")]
    MessageNotFound(i64),
}

/// A job that has been recorded and handed to the runtime.
#[derive(Debug)]
pub struct StartedJob {
    pub job: RuleApplicationJob,
    pub handle: JoinHandle<()>,
}

/// Entry points for rule application: bulk jobs, preview and per-message
/// classification.
#[derive(Clone)]
pub struct RuleApplicationService {
    rules: RuleRepository,
    jobs: RuleApplicationJobRepository,
    store: Arc<dyn RuleTargetStore>,
    config: RulesConfig,
}

impl RuleApplicationService {
    pub fn new(db: Database, config: RulesConfig) -> Self {
        let store: Arc<dyn RuleTargetStore> = Arc::new(MessageRepository::new(db.clone()));
        Self::with_store(
            RuleRepository::new(db.clone()),
            RuleApplicationJobRepository::new(db),
            store,
            config,
        )
    }

    pub fn with_store(
        rules: RuleRepository,
        jobs: RuleApplicationJobRepository,
        store: Arc<dyn RuleTargetStore>,
        config: RulesConfig,
    ) -> Self {
        Self {
            rules,
            jobs,
            store,
            config,
        }
    }

    pub fn rules(&self) -> &RuleRepository {
        &self.rules
    }

    pub fn jobs(&self) -> &RuleApplicationJobRepository {
        &self.jobs
    }

    /// Start a job applying one rule over its scoping containers. Disabled rules
    /// may be applied explicitly.
    pub async fn apply_rule(&self, rule_id: &str) -> Result<StartedJob, ServiceError> {
        let rule = self.rules.get_by_id(rule_id).await?;
        let scope = ContainerScope::from_ids(rule.container_ids.clone());
        let plan = ApplicationPlan::SingleRule(Box::new(CompiledRule::compile(rule)));
        self.start(Some(rule_id.to_string()), scope, plan).await
    }

    /// Start a job running priority selection over every enabled rule. An empty
    /// id list covers all containers.
    pub async fn apply_all(&self, container_ids: Vec<i64>) -> Result<StartedJob, ServiceError> {
        let rules = RuleSet::compile(self.rules.list_enabled().await?);
        let scope = ContainerScope::from_ids(container_ids);
        self.start(None, scope, ApplicationPlan::AllRules(rules))
            .await
    }

    async fn start(
        &self,
        rule_id: Option<String>,
        scope: ContainerScope,
        plan: ApplicationPlan,
    ) -> Result<StartedJob, ServiceError> {
        let total_count = self.store.count_in_scope(&scope).await?;
        let job = self
            .jobs
            .create(NewRuleApplicationJob {
                rule_id,
                scope: scope.clone(),
                total_count,
            })
            .await?;
        info!(job_id = %job.id, mode = plan.mode(), total_count, "rule application job created");

        let runner = BatchRunner::new(
            self.store.clone(),
            Arc::new(self.jobs.clone()),
            self.config.batch_page_size,
        );
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move { runner.run_job(job_id, scope, plan).await });

        Ok(StartedJob { job, handle })
    }

    /// Dry-run a draft condition tree. Caps default to, and are clamped by, the
    /// configured maxima.
    pub async fn preview(
        &self,
        conditions: &ConditionGroup,
        container_ids: Vec<i64>,
        scan_cap: Option<u32>,
        match_cap: Option<u32>,
    ) -> Result<PreviewOutcome, ServiceError> {
        validate_group(conditions)?;
        let scan_cap = scan_cap
            .unwrap_or(self.config.preview_max_scan)
            .min(self.config.preview_max_scan);
        let match_cap = match_cap
            .unwrap_or(self.config.preview_max_matches)
            .min(self.config.preview_max_matches);

        let evaluator = PreviewEvaluator::new(self.store.clone(), self.config.preview_page_size);
        Ok(evaluator
            .preview(
                conditions,
                &ContainerScope::from_ids(container_ids),
                scan_cap,
                match_cap,
            )
            .await?)
    }

    /// Select the winning enabled rule for one message, applying its action when
    /// `apply` is set.
    pub async fn classify_message(
        &self,
        message_id: i64,
        apply: bool,
    ) -> Result<Option<RuleMatch>, ServiceError> {
        let item = self
            .store
            .find_item(message_id)
            .await?
            .ok_or(ServiceError::MessageNotFound(message_id))?;
        let ctx = self
            .store
            .build_context(&item)
            .await?
            .ok_or(ServiceError::MessageNotFound(message_id))?;

        let rules = RuleSet::compile(self.rules.list_enabled().await?);
        let Some(rule_match) = rules.select(&ctx, Some(item.container_id)) else {
            return Ok(None);
        };

        if apply {
            let action = apply_match(self.store.as_ref(), &item, &rule_match).await?;
            info!(message_id, rule_id = %rule_match.rule_id, ?action, "classified message");
        }
        Ok(Some(rule_match))
    }

    /// Fail jobs left running by a previous process. Call once at startup.
    pub async fn recover_abandoned(&self) -> Result<u64, ServiceError> {
        Ok(self.jobs.fail_abandoned(INTERRUPTED_ERROR).await?)
    }

    /// Delete finished jobs older than the retention window.
    pub async fn prune_expired(&self) -> Result<u64, ServiceError> {
        let cutoff = Duration::try_days(i64::from(self.config.job_retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            warn!(
                job_retention_days = self.config.job_retention_days,
                "retention window out of range; skipping sweep"
            );
            return Ok(0);
        };
        Ok(self.jobs.prune_finished_before(cutoff).await?)
    }
}
