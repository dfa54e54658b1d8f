use std::{env, path::Path, sync::Arc};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

/// Milliseconds a local connection waits on a locked database before failing.
/// Rule appends take a write lock up front, so concurrent appends queue here.
const LOCAL_BUSY_TIMEOUT_MS: u32 = 5_000;

/// Where a rule store lives: a local SQLite file or a remote libsql endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location<'a> {
    Local(&'a str),
    Remote(&'a str),
}

impl<'a> Location<'a> {
    fn parse(path: &'a str) -> Self {
        const REMOTE_SCHEMES: [&str; 3] = ["libsql://", "http://", "https://"];
        if REMOTE_SCHEMES.iter().any(|scheme| path.starts_with(scheme)) {
            Location::Remote(path)
        } else {
            Location::Local(path)
        }
    }
}

/// Shared handle to the rule store. Cloning is cheap.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
    local: bool,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("could not open rule store: {0}")]
    Build(libsql::Error),
    #[error("could not connect to rule store: {0}")]
    Connect(libsql::Error),
    #[error("rule store statement failed: {0}")]
    Statement(libsql::Error),
    #[error("LIBSQL_AUTH_TOKEN must be set to use a remote rule store")]
    MissingAuthToken,
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let path = database_path.to_string_lossy();
        let location = Location::parse(&path);
        let inner = match location {
            Location::Remote(url) => {
                let token = env::var("LIBSQL_AUTH_TOKEN")
                    .ok()
                    .filter(|token| !token.is_empty())
                    .ok_or(DbError::MissingAuthToken)?;
                Builder::new_remote(url.to_string(), token).build().await
            }
            Location::Local(file) => Builder::new_local(file).build().await,
        }
        .map_err(DbError::Build)?;

        Ok(Self {
            inner: Arc::new(inner),
            local: matches!(location, Location::Local(_)),
        })
    }

    /// Open a connection with foreign keys enforced. Local connections also
    /// wait on a locked file instead of failing immediately.
    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(DbError::Statement)?;
        if self.local {
            // busy_timeout echoes the new value as a row.
            first_row(&conn, &format!("PRAGMA busy_timeout = {LOCAL_BUSY_TIMEOUT_MS}")).await?;
        }
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        first_row(&conn, "SELECT 1").await
    }
}

async fn first_row(conn: &Connection, sql: &str) -> Result<(), DbError> {
    let mut rows = conn.query(sql, ()).await.map_err(DbError::Statement)?;
    rows.next().await.map_err(DbError::Statement)?;
    Ok(())
}
