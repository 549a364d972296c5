use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{Database, DbError};

const CONTAINER_COLUMNS: &str = "id, name, created_at";

/// A folder-like destination messages live in and rules move them between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("container not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct ContainerRepository {
    db: Database,
}

impl ContainerRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, name: &str) -> Result<Container, ContainerError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO containers (name, created_at) VALUES (?1, ?2)
                     RETURNING {CONTAINER_COLUMNS}"
                ),
                params![name, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_container(row),
            None => Err(ContainerError::NotFound(name.to_string())),
        }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Container, ContainerError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_container(row),
            None => Err(ContainerError::NotFound(id.to_string())),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Container>, ContainerError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {CONTAINER_COLUMNS} FROM containers ORDER BY id"),
                (),
            )
            .await?;

        let mut containers = Vec::new();
        while let Some(row) = rows.next().await? {
            containers.push(row_to_container(row)?);
        }
        Ok(containers)
    }
}

fn row_to_container(row: Row) -> Result<Container, ContainerError> {
    let created_at: String = row.get(2)?;
    Ok(Container {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_list_and_get() {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("db.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");
        let repo = ContainerRepository::new(db);

        let inbox = repo.create("Inbox").await.expect("inbox");
        let archive = repo.create("Archive").await.expect("archive");

        let all = repo.list_all().await.expect("list");
        assert_eq!(all, vec![inbox.clone(), archive]);
        assert_eq!(repo.get_by_id(inbox.id).await.expect("get"), inbox);
        assert!(matches!(
            repo.get_by_id(999).await,
            Err(ContainerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("db.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");
        let repo = ContainerRepository::new(db);

        repo.create("Inbox").await.expect("first");
        assert!(matches!(
            repo.create("Inbox").await,
            Err(ContainerError::Sql(_))
        ));
    }
}
