//! In-memory collaborators for exercising the engine without a database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::jobs::repository::{JobProgress, JobRecordError};
use crate::jobs::scope::{ContainerScope, ItemRef, JobProgressStore, RuleTargetStore, StoreError};
use crate::rules::actions::RuleAction;
use crate::rules::conditions::{
    Condition, ConditionField, ConditionGroup, ConditionNode, GroupOperator, MatchType,
};
use crate::rules::context::RuleEvaluationContext;
use crate::rules::types::{ActionType, Rule};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMessage {
    pub container_id: i64,
    pub conversation_id: Option<i64>,
    pub is_read: bool,
    pub is_starred: bool,
    pub context: RuleEvaluationContext,
}

#[derive(Default)]
struct StoreState {
    messages: BTreeMap<i64, FakeMessage>,
    vanish_on_context: BTreeSet<i64>,
    panic_on_context: BTreeSet<i64>,
    fail_actions: BTreeSet<i64>,
    fail_page_call: Option<usize>,
    page_calls: usize,
    action_calls: usize,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    /// `count` messages with ids `1..=count`, all in `container_id`, subject "message N".
    pub fn with_messages(count: i64, container_id: i64) -> Self {
        let store = Self::default();
        for id in 1..=count {
            store.insert(
                id,
                container_id,
                RuleEvaluationContext {
                    subject: Some(format!("message {id}")),
                    ..Default::default()
                },
            );
        }
        store
    }

    pub fn insert(&self, id: i64, container_id: i64, context: RuleEvaluationContext) {
        self.lock().messages.insert(
            id,
            FakeMessage {
                container_id,
                conversation_id: None,
                is_read: false,
                is_starred: false,
                context,
            },
        );
    }

    pub fn set_subject(&self, id: i64, subject: &str) {
        if let Some(message) = self.lock().messages.get_mut(&id) {
            message.context.subject = Some(subject.to_string());
        }
    }

    pub fn set_sender(&self, id: i64, sender_email: &str) {
        if let Some(message) = self.lock().messages.get_mut(&id) {
            message.context.sender_email = Some(sender_email.to_string());
        }
    }

    /// The item stays in paging results but its context lookup reports it gone.
    pub fn vanish_on_context(&self, id: i64) {
        self.lock().vanish_on_context.insert(id);
    }

    pub fn panic_on_context(&self, id: i64) {
        self.lock().panic_on_context.insert(id);
    }

    pub fn fail_action_for(&self, id: i64) {
        self.lock().fail_actions.insert(id);
    }

    /// Fail the `call`th page request, counting from 1.
    pub fn fail_page_call(&self, call: usize) {
        self.lock().fail_page_call = Some(call);
    }

    pub fn item(&self, id: i64) -> ItemRef {
        let state = self.lock();
        let message = &state.messages[&id];
        ItemRef {
            message_id: id,
            conversation_id: message.conversation_id,
            container_id: message.container_id,
        }
    }

    pub fn container_of(&self, id: i64) -> Option<i64> {
        self.lock()
            .messages
            .get(&id)
            .map(|message| message.container_id)
    }

    pub fn message(&self, id: i64) -> Option<FakeMessage> {
        self.lock().messages.get(&id).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<i64, FakeMessage> {
        self.lock().messages.clone()
    }

    pub fn page_calls(&self) -> usize {
        self.lock().page_calls
    }

    pub fn action_calls(&self) -> usize {
        self.lock().action_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("store lock")
    }
}

#[async_trait]
impl RuleTargetStore for InMemoryStore {
    async fn count_in_scope(&self, scope: &ContainerScope) -> Result<i64, StoreError> {
        let state = self.lock();
        Ok(state
            .messages
            .values()
            .filter(|message| scope.contains(message.container_id))
            .count() as i64)
    }

    async fn page_in_scope(
        &self,
        scope: &ContainerScope,
        page_size: u32,
        after: Option<i64>,
    ) -> Result<Vec<ItemRef>, StoreError> {
        let mut state = self.lock();
        state.page_calls += 1;
        if state.fail_page_call == Some(state.page_calls) {
            return Err(StoreError::Backend("page read failed".into()));
        }
        let after = after.unwrap_or(i64::MIN);
        Ok(state
            .messages
            .range(after.saturating_add(1)..)
            .filter(|(_, message)| scope.contains(message.container_id))
            .take(page_size as usize)
            .map(|(id, message)| ItemRef {
                message_id: *id,
                conversation_id: message.conversation_id,
                container_id: message.container_id,
            })
            .collect())
    }

    async fn build_context(
        &self,
        item: &ItemRef,
    ) -> Result<Option<RuleEvaluationContext>, StoreError> {
        let state = self.lock();
        if state.panic_on_context.contains(&item.message_id) {
            drop(state);
            panic!("context builder exploded");
        }
        if state.vanish_on_context.contains(&item.message_id) {
            return Ok(None);
        }
        Ok(state
            .messages
            .get(&item.message_id)
            .map(|message| message.context.clone()))
    }

    async fn apply_action(&self, item: &ItemRef, action: &RuleAction) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.action_calls += 1;
        if state.fail_actions.contains(&item.message_id) {
            return Err(StoreError::Backend("action rejected".into()));
        }
        let Some(message) = state.messages.get_mut(&item.message_id) else {
            return Ok(());
        };
        match action {
            RuleAction::MoveToContainer { container_id } => message.container_id = *container_id,
            RuleAction::MarkRead => message.is_read = true,
            RuleAction::Star => message.is_starred = true,
        }
        Ok(())
    }

    async fn find_item(&self, message_id: i64) -> Result<Option<ItemRef>, StoreError> {
        let state = self.lock();
        Ok(state.messages.get(&message_id).map(|message| ItemRef {
            message_id,
            conversation_id: message.conversation_id,
            container_id: message.container_id,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Update(JobProgress),
    Complete(JobProgress),
    Fail(String),
}

#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
    fail_update_call: Mutex<Option<usize>>,
}

impl RecordingProgress {
    /// Fail the `call`th progress update, counting from 1.
    pub fn fail_update_call(&self, call: usize) {
        *self.fail_update_call.lock().expect("progress lock") = Some(call);
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("progress lock").clone()
    }

    pub fn processed_updates(&self) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Update(progress) => Some(progress.processed_count),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl JobProgressStore for RecordingProgress {
    async fn update_progress(
        &self,
        job_id: &str,
        progress: &JobProgress,
    ) -> Result<(), JobRecordError> {
        let mut events = self.events.lock().expect("progress lock");
        let updates = events
            .iter()
            .filter(|event| matches!(event, ProgressEvent::Update(_)))
            .count();
        if *self.fail_update_call.lock().expect("progress lock") == Some(updates + 1) {
            return Err(JobRecordError::NotRunning(job_id.to_string()));
        }
        events.push(ProgressEvent::Update(progress.clone()));
        Ok(())
    }

    async fn complete(&self, _job_id: &str, progress: &JobProgress) -> Result<(), JobRecordError> {
        self.events
            .lock()
            .expect("progress lock")
            .push(ProgressEvent::Complete(progress.clone()));
        Ok(())
    }

    async fn fail(&self, _job_id: &str, error: &str) -> Result<(), JobRecordError> {
        self.events
            .lock()
            .expect("progress lock")
            .push(ProgressEvent::Fail(error.to_string()));
        Ok(())
    }
}

pub fn subject_contains(value: &str) -> ConditionGroup {
    ConditionGroup {
        operator: GroupOperator::And,
        conditions: vec![ConditionNode::Leaf(Condition {
            field: ConditionField::Subject,
            match_type: MatchType::Contains,
            value: value.into(),
            negate: false,
            header: None,
        })],
    }
}

/// An enabled, unscoped rule.
pub fn rule_fixture(
    id: &str,
    position: i64,
    conditions: ConditionGroup,
    action_type: ActionType,
    action_config: Value,
) -> Rule {
    Rule {
        id: id.into(),
        name: format!("rule {id}"),
        conditions,
        action_type,
        action_config,
        container_ids: vec![],
        position,
        enabled: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
