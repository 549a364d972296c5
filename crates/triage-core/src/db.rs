use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

const BUSY_TIMEOUT_MS: u32 = 5_000;

#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("missing required LIBSQL_AUTH_TOKEN for remote database")]
    MissingAuthToken,
}

#[derive(Debug, PartialEq, Eq)]
enum Location {
    Local(PathBuf),
    Remote(String),
}

impl Location {
    fn parse(database_path: &Path) -> Self {
        let raw = database_path.to_string_lossy();
        if ["libsql://", "http://", "https://"]
            .iter()
            .any(|scheme| raw.starts_with(scheme))
        {
            Location::Remote(raw.into_owned())
        } else {
            Location::Local(database_path.to_path_buf())
        }
    }
}

impl Database {
    /// Open a local file (parent directories are created) or a remote libsql URL,
    /// which requires `LIBSQL_AUTH_TOKEN`.
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let inner = match Location::parse(database_path) {
            Location::Remote(url) => {
                let auth_token = env::var("LIBSQL_AUTH_TOKEN")
                    .ok()
                    .filter(|token| !token.is_empty())
                    .ok_or(DbError::MissingAuthToken)?;
                Builder::new_remote(url, auth_token).build().await
            }
            Location::Local(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|source| DbError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                Builder::new_local(path).build().await
            }
        }
        .map_err(DbError::Build)?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// A fresh connection with foreign keys enforced and a busy timeout, so a
    /// batch job and a request handler writing at once wait instead of failing.
    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        let busy_timeout = format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}");
        for pragma in ["PRAGMA foreign_keys = ON", busy_timeout.as_str()] {
            // busy_timeout echoes its value back as a row.
            let mut rows = conn.query(pragma, ()).await.map_err(DbError::Statement)?;
            while rows.next().await.map_err(DbError::Statement)?.is_some() {}
        }
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}
