use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    prelude::FromRow,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;
use tracing::error;

use crate::{
    definition::{
        BodyType, Collection, Environment, NewCollection, NewEnvironment, NewRequest,
        RequestDefinition, RequestUpdate,
    },
    history::{HistoryEntry, NewHistoryEntry},
    method::Method,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collection (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS request (
    id TEXT PRIMARY KEY NOT NULL,
    collection_id TEXT NOT NULL,
    name TEXT NOT NULL,
    method VARCHAR(16) NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    params TEXT NOT NULL,
    body TEXT NOT NULL,
    body_type VARCHAR(16) NOT NULL,
    tests TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    FOREIGN KEY (collection_id) REFERENCES collection(id)
);

CREATE TABLE IF NOT EXISTS environment (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    variables TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS history (
    id TEXT PRIMARY KEY NOT NULL,
    request_id TEXT NOT NULL,
    method VARCHAR(16) NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_time INTEGER NOT NULL,
    response_body TEXT NOT NULL,
    response_headers TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (request_id) REFERENCES request(id)
);
"#;

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("{kind} \"{id}\" is not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    Internal(String),
}

impl StoreError {
    fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        error!("store query failed: {}", err);
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("corrupt document: {}", err))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Document store for collections, request definitions, environments and
/// the append-only execution history.
#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct CollectionRow {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CollectionRow> for Collection {
    fn from(row: CollectionRow) -> Self {
        Collection {
            id: row.id,
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct RequestRow {
    id: String,
    collection_id: String,
    name: String,
    method: String,
    url: String,
    headers: String,
    params: String,
    body: String,
    body_type: String,
    tests: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RequestRow> for RequestDefinition {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        Ok(RequestDefinition {
            id: row.id,
            collection_id: row.collection_id,
            name: row.name,
            method: Method::try_from(row.method.as_str()).map_err(StoreError::Internal)?,
            url: row.url,
            headers: from_json(&row.headers)?,
            params: from_json(&row.params)?,
            body: row.body,
            body_type: BodyType::try_from(row.body_type.as_str()).map_err(StoreError::Internal)?,
            tests: from_json(&row.tests)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EnvironmentRow {
    id: String,
    name: String,
    variables: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EnvironmentRow> for Environment {
    type Error = StoreError;

    fn try_from(row: EnvironmentRow) -> Result<Self, Self::Error> {
        Ok(Environment {
            id: row.id,
            name: row.name,
            variables: from_json(&row.variables)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct HistoryRow {
    id: String,
    request_id: String,
    method: String,
    url: String,
    status: i64,
    response_time: i64,
    response_body: String,
    response_headers: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let response_headers: IndexMap<String, String> = from_json(&row.response_headers)?;
        Ok(HistoryEntry {
            id: row.id,
            entry: NewHistoryEntry {
                request_id: row.request_id,
                method: Method::try_from(row.method.as_str()).map_err(StoreError::Internal)?,
                url: row.url,
                status: row.status as u16,
                response_time: row.response_time as u64,
                response_body: row.response_body,
                response_headers,
            },
            created_at: row.created_at,
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(src: &str) -> StoreResult<T> {
    Ok(serde_json::from_str(src)?)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

const REQUEST_COLUMNS: &str = "id, collection_id, name, method, url, headers, params, body, body_type, tests, created_at, updated_at";

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens `url`, creating the database file when missing. An in-memory
    /// database is pinned to one connection so every query sees the same data.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        Ok(Self::new(pool))
    }

    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Collections

    pub async fn list_collections(&self) -> StoreResult<Vec<Collection>> {
        let rows: Vec<CollectionRow> = sqlx::query_as(
            "SELECT id, name, created_at, updated_at FROM collection ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Collection::from).collect())
    }

    pub async fn get_collection(&self, id: &str) -> StoreResult<Collection> {
        let row: Option<CollectionRow> =
            sqlx::query_as("SELECT id, name, created_at, updated_at FROM collection WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Collection::from)
            .ok_or_else(|| StoreError::not_found("collection", id))
    }

    pub async fn create_collection(&self, new: &NewCollection) -> StoreResult<Collection> {
        let now = Utc::now();
        let collection = Collection {
            id: new_id(),
            name: new.name.clone(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query("INSERT INTO collection (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(&collection.id)
            .bind(&collection.name)
            .bind(collection.created_at)
            .bind(collection.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(collection)
    }

    pub async fn update_collection(&self, id: &str, update: &NewCollection) -> StoreResult<Collection> {
        let qr = sqlx::query("UPDATE collection SET name = ?, updated_at = ? WHERE id = ?")
            .bind(&update.name)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if qr.rows_affected() == 0 {
            return Err(StoreError::not_found("collection", id));
        }
        self.get_collection(id).await
    }

    /// Deletes the collection together with its requests and their history.
    pub async fn delete_collection(&self, id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM history WHERE request_id IN (SELECT id FROM request WHERE collection_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM request WHERE collection_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let qr = sqlx::query("DELETE FROM collection WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if qr.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::not_found("collection", id));
        }
        tx.commit().await?;
        Ok(())
    }

    // Requests

    pub async fn list_requests(&self, collection_id: &str) -> StoreResult<Vec<RequestDefinition>> {
        self.get_collection(collection_id).await?;
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM request WHERE collection_id = ? ORDER BY rowid",
            REQUEST_COLUMNS
        ))
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RequestDefinition::try_from).collect()
    }

    pub async fn get_request(&self, id: &str) -> StoreResult<RequestDefinition> {
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM request WHERE id = ?",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::not_found("request", id))?
            .try_into()
    }

    pub async fn create_request(&self, new: &NewRequest) -> StoreResult<RequestDefinition> {
        self.get_collection(&new.collection_id).await?;

        let now = Utc::now();
        let request = RequestDefinition {
            id: new_id(),
            collection_id: new.collection_id.clone(),
            name: new.name.clone(),
            method: new.method,
            url: new.url.clone(),
            headers: new.headers.clone(),
            params: new.params.clone(),
            body: new.body.clone(),
            body_type: new.body_type,
            tests: new.tests.clone(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(&format!(
            "INSERT INTO request ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            REQUEST_COLUMNS
        ))
        .bind(&request.id)
        .bind(&request.collection_id)
        .bind(&request.name)
        .bind(request.method.to_string())
        .bind(&request.url)
        .bind(to_json(&request.headers)?)
        .bind(to_json(&request.params)?)
        .bind(&request.body)
        .bind(request.body_type.as_str())
        .bind(to_json(&request.tests)?)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(request)
    }

    pub async fn update_request(
        &self,
        id: &str,
        update: &RequestUpdate,
    ) -> StoreResult<RequestDefinition> {
        let qr = sqlx::query(
            "UPDATE request SET name = ?, method = ?, url = ?, headers = ?, params = ?, body = ?, body_type = ?, tests = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&update.name)
        .bind(update.method.to_string())
        .bind(&update.url)
        .bind(to_json(&update.headers)?)
        .bind(to_json(&update.params)?)
        .bind(&update.body)
        .bind(update.body_type.as_str())
        .bind(to_json(&update.tests)?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if qr.rows_affected() == 0 {
            return Err(StoreError::not_found("request", id));
        }
        self.get_request(id).await
    }

    pub async fn delete_request(&self, id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM history WHERE request_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let qr = sqlx::query("DELETE FROM request WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if qr.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::not_found("request", id));
        }
        tx.commit().await?;
        Ok(())
    }

    // Environments

    pub async fn list_environments(&self) -> StoreResult<Vec<Environment>> {
        let rows: Vec<EnvironmentRow> = sqlx::query_as(
            "SELECT id, name, variables, created_at, updated_at FROM environment ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Environment::try_from).collect()
    }

    pub async fn get_environment(&self, id: &str) -> StoreResult<Environment> {
        let row: Option<EnvironmentRow> = sqlx::query_as(
            "SELECT id, name, variables, created_at, updated_at FROM environment WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::not_found("environment", id))?
            .try_into()
    }

    pub async fn create_environment(&self, new: &NewEnvironment) -> StoreResult<Environment> {
        let now = Utc::now();
        let environment = Environment {
            id: new_id(),
            name: new.name.clone(),
            variables: new.variables.clone(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO environment (id, name, variables, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&environment.id)
        .bind(&environment.name)
        .bind(to_json(&environment.variables)?)
        .bind(environment.created_at)
        .bind(environment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(environment)
    }

    pub async fn update_environment(
        &self,
        id: &str,
        update: &NewEnvironment,
    ) -> StoreResult<Environment> {
        let qr = sqlx::query(
            "UPDATE environment SET name = ?, variables = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&update.name)
        .bind(to_json(&update.variables)?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if qr.rows_affected() == 0 {
            return Err(StoreError::not_found("environment", id));
        }
        self.get_environment(id).await
    }

    pub async fn delete_environment(&self, id: &str) -> StoreResult<()> {
        let qr = sqlx::query("DELETE FROM environment WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if qr.rows_affected() == 0 {
            return Err(StoreError::not_found("environment", id));
        }
        Ok(())
    }

    // History

    pub async fn append_history(&self, entry: &NewHistoryEntry) -> StoreResult<HistoryEntry> {
        self.get_request(&entry.request_id).await?;

        let history = HistoryEntry {
            id: new_id(),
            entry: entry.clone(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO history (id, request_id, method, url, status, response_time, response_body, response_headers, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&history.id)
        .bind(&entry.request_id)
        .bind(entry.method.to_string())
        .bind(&entry.url)
        .bind(entry.status as i64)
        .bind(entry.response_time as i64)
        .bind(&entry.response_body)
        .bind(to_json(&entry.response_headers)?)
        .bind(history.created_at)
        .execute(&self.pool)
        .await?;
        Ok(history)
    }

    /// Newest first, at most `limit` entries.
    pub async fn history(&self, request_id: &str, limit: u32) -> StoreResult<Vec<HistoryEntry>> {
        self.get_request(request_id).await?;

        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT id, request_id, method, url, status, response_time, response_body, response_headers, created_at FROM history WHERE request_id = ? ORDER BY rowid DESC LIMIT ?",
        )
        .bind(request_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HistoryEntry::try_from).collect()
    }
}
