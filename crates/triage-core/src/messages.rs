use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::jobs::scope::{ContainerScope, ItemRef, RuleTargetStore, StoreError};
use crate::rules::actions::RuleAction;
use crate::rules::context::{Address, Header, RuleEvaluationContext};

const MESSAGE_COLUMNS: &str = "id, container_id, conversation_id, subject, body_text, sender_email, sender_name, to_json, cc_json, bcc_json, attachments_json, headers_json, is_read, is_starred, received_at, created_at, updated_at";

/// Matches every container when the bound scope is NULL.
const SCOPE_FILTER: &str =
    "(?1 IS NULL OR container_id IN (SELECT value FROM json_each(?1)))";

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub container_id: i64,
    pub conversation_id: Option<i64>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub attachment_filenames: Vec<String>,
    pub headers: Vec<Header>,
    pub is_read: bool,
    pub is_starred: bool,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Already-extracted message fields handed over by ingestion.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub container_id: i64,
    pub conversation_id: Option<i64>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub sender: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub attachment_filenames: Vec<String>,
    pub headers: Vec<Header>,
    pub received_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(container_id: i64) -> Self {
        Self {
            container_id,
            conversation_id: None,
            subject: None,
            body_text: None,
            sender: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            attachment_filenames: Vec::new(),
            headers: Vec::new(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("message not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, new_msg: NewMessage) -> Result<Message, MessageError> {
        let NewMessage {
            container_id,
            conversation_id,
            subject,
            body_text,
            sender,
            to,
            cc,
            bcc,
            attachment_filenames,
            headers,
            received_at,
        } = new_msg;

        let now = now_rfc3339();
        let (sender_email, sender_name) = match sender {
            Some(address) => (Some(address.email), address.name),
            None => (None, None),
        };
        let to_json = serde_json::to_string(&to)?;
        let cc_json = serde_json::to_string(&cc)?;
        let bcc_json = serde_json::to_string(&bcc)?;
        let attachments_json = serde_json::to_string(&attachment_filenames)?;
        let headers_json = serde_json::to_string(&headers)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO messages (container_id, conversation_id, subject, body_text, sender_email, sender_name, to_json, cc_json, bcc_json, attachments_json, headers_json, is_read, is_starred, received_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, 0, ?12, ?13, ?13)
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![
                    container_id,
                    conversation_id,
                    subject,
                    body_text,
                    sender_email,
                    sender_name,
                    to_json,
                    cc_json,
                    bcc_json,
                    attachments_json,
                    headers_json,
                    to_rfc3339(received_at),
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound("insert failed".into())),
        }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Message, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(id.to_string())),
        }
    }

    pub async fn delete(&self, id: i64) -> Result<(), MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query("DELETE FROM messages WHERE id = ?1 RETURNING id", params![id])
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(MessageError::NotFound(id.to_string())),
        }
    }

    pub async fn count_matching_scope(&self, scope: &ContainerScope) -> Result<i64, MessageError> {
        let scope_json = scope_param(scope)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT COUNT(*) FROM messages WHERE {SCOPE_FILTER}"),
                params![scope_json],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Keyset page: ids strictly greater than `after`, ascending.
    pub async fn page_after(
        &self,
        scope: &ContainerScope,
        page_size: u32,
        after: Option<i64>,
    ) -> Result<Vec<ItemRef>, MessageError> {
        let scope_json = scope_param(scope)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT id, conversation_id, container_id FROM messages
                     WHERE {SCOPE_FILTER} AND (?2 IS NULL OR id > ?2)
                     ORDER BY id
                     LIMIT ?3"
                ),
                params![scope_json, after, i64::from(page_size)],
            )
            .await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }

    pub async fn item_ref(&self, message_id: i64) -> Result<Option<ItemRef>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, conversation_id, container_id FROM messages WHERE id = ?1",
                params![message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_item(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn evaluation_context(
        &self,
        message_id: i64,
    ) -> Result<Option<RuleEvaluationContext>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT m.subject, c.subject, m.body_text, m.sender_email, m.sender_name,
                        m.to_json, m.cc_json, m.bcc_json, m.attachments_json, m.headers_json
                 FROM messages m
                 LEFT JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.id = ?1",
                params![message_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let to_json: String = row.get(5)?;
        let cc_json: String = row.get(6)?;
        let bcc_json: String = row.get(7)?;
        let attachments_json: String = row.get(8)?;
        let headers_json: String = row.get(9)?;

        Ok(Some(RuleEvaluationContext {
            subject: row.get(0)?,
            conversation_subject: row.get(1)?,
            body_text: row.get(2)?,
            sender_email: row.get(3)?,
            sender_name: row.get(4)?,
            to: serde_json::from_str(&to_json)?,
            cc: serde_json::from_str(&cc_json)?,
            bcc: serde_json::from_str(&bcc_json)?,
            attachment_filenames: serde_json::from_str(&attachments_json)?,
            headers: serde_json::from_str(&headers_json)?,
        }))
    }

    /// Each statement is guarded so a repeated action leaves the row untouched,
    /// `updated_at` included. A message that no longer exists is `NotFound`.
    pub async fn apply(&self, message_id: i64, action: &RuleAction) -> Result<(), MessageError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let changed = match action {
            RuleAction::MoveToContainer { container_id } => {
                conn.execute(
                    "UPDATE messages SET container_id = ?2, updated_at = ?3
                     WHERE id = ?1 AND container_id != ?2",
                    params![message_id, *container_id, now],
                )
                .await?
            }
            RuleAction::MarkRead => {
                conn.execute(
                    "UPDATE messages SET is_read = 1, updated_at = ?2 WHERE id = ?1 AND is_read = 0",
                    params![message_id, now],
                )
                .await?
            }
            RuleAction::Star => {
                conn.execute(
                    "UPDATE messages SET is_starred = 1, updated_at = ?2 WHERE id = ?1 AND is_starred = 0",
                    params![message_id, now],
                )
                .await?
            }
        };

        if changed == 0 {
            let mut rows = conn
                .query("SELECT 1 FROM messages WHERE id = ?1", params![message_id])
                .await?;
            if rows.next().await?.is_none() {
                return Err(MessageError::NotFound(message_id.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RuleTargetStore for MessageRepository {
    async fn count_in_scope(&self, scope: &ContainerScope) -> Result<i64, StoreError> {
        Ok(self.count_matching_scope(scope).await?)
    }

    async fn page_in_scope(
        &self,
        scope: &ContainerScope,
        page_size: u32,
        after: Option<i64>,
    ) -> Result<Vec<ItemRef>, StoreError> {
        Ok(self.page_after(scope, page_size, after).await?)
    }

    async fn build_context(
        &self,
        item: &ItemRef,
    ) -> Result<Option<RuleEvaluationContext>, StoreError> {
        Ok(self.evaluation_context(item.message_id).await?)
    }

    async fn apply_action(&self, item: &ItemRef, action: &RuleAction) -> Result<(), StoreError> {
        Ok(self.apply(item.message_id, action).await?)
    }

    async fn find_item(&self, message_id: i64) -> Result<Option<ItemRef>, StoreError> {
        Ok(self.item_ref(message_id).await?)
    }
}

fn scope_param(scope: &ContainerScope) -> Result<Option<String>, MessageError> {
    Ok(scope
        .container_ids()
        .map(serde_json::to_string)
        .transpose()?)
}

fn row_to_item(row: &Row) -> Result<ItemRef, MessageError> {
    Ok(ItemRef {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        container_id: row.get(2)?,
    })
}

fn row_to_message(row: Row) -> Result<Message, MessageError> {
    let to_json: String = row.get(7)?;
    let cc_json: String = row.get(8)?;
    let bcc_json: String = row.get(9)?;
    let attachments_json: String = row.get(10)?;
    let headers_json: String = row.get(11)?;
    let is_read: i64 = row.get(12)?;
    let is_starred: i64 = row.get(13)?;
    let received_at: String = row.get(14)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;

    Ok(Message {
        id: row.get(0)?,
        container_id: row.get(1)?,
        conversation_id: row.get(2)?,
        subject: row.get(3)?,
        body_text: row.get(4)?,
        sender_email: row.get(5)?,
        sender_name: row.get(6)?,
        to: serde_json::from_str(&to_json)?,
        cc: serde_json::from_str(&cc_json)?,
        bcc: serde_json::from_str(&bcc_json)?,
        attachment_filenames: serde_json::from_str(&attachments_json)?,
        headers: serde_json::from_str(&headers_json)?,
        is_read: is_read != 0,
        is_starred: is_starred != 0,
        received_at: DateTime::parse_from_rfc3339(&received_at)?.with_timezone(&Utc),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
