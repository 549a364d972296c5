use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{Database, DbError};

const CONVERSATION_COLUMNS: &str = "id, subject, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("conversation not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct ConversationRepository {
    db: Database,
}

impl ConversationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, subject: Option<&str>) -> Result<Conversation, ConversationError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO conversations (subject, created_at, updated_at) VALUES (?1, ?2, ?2)
                     RETURNING {CONVERSATION_COLUMNS}"
                ),
                params![subject, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_conversation(row),
            None => Err(ConversationError::NotFound("insert failed".into())),
        }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Conversation, ConversationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_conversation(row),
            None => Err(ConversationError::NotFound(id.to_string())),
        }
    }
}

fn row_to_conversation(row: Row) -> Result<Conversation, ConversationError> {
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    Ok(Conversation {
        id: row.get(0)?,
        subject: row.get(1)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}
