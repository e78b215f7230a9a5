use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::models::{ContactType, ResultRow};

/// Append-only per-file classification log (§4.3). A (file_id, e164) pair is
/// written at most once (I4); `insert_batch` is all-or-nothing.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn insert_batch(&self, file_id: &str, rows: Vec<ResultRow>) -> EngineResult<()>;
    async fn list(&self, file_id: &str) -> EngineResult<Vec<ResultRow>>;
    async fn distinct_e164(&self, file_id: &str) -> EngineResult<HashSet<String>>;
    async fn count(&self, file_id: &str) -> EngineResult<i64>;

    /// Removes the (file, e164) row, if any — used by `reprocess-single`
    /// (§4.7) ahead of a fresh classification.
    async fn delete_one(&self, file_id: &str, e164: &str) -> EngineResult<()>;
}

pub struct PostgresResultStore {
    pool: deadpool_postgres::Pool,
}

impl PostgresResultStore {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    async fn insert_batch(&self, file_id: &str, rows: Vec<ResultRow>) -> EngineResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        let stmt = transaction
            .prepare(
                "INSERT INTO blooio_results
                 (file_id, phone_number, e164, is_ios, supports_imessage, supports_sms, contact_type, error, from_cache)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .await?;

        for row in &rows {
            transaction
                .execute(
                    &stmt,
                    &[
                        &file_id,
                        &row.phone_number,
                        &row.e164,
                        &row.is_ios,
                        &row.supports_imessage,
                        &row.supports_sms,
                        &contact_type_str(row.contact_type),
                        &row.error,
                        &row.from_cache,
                    ],
                )
                .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn list(&self, file_id: &str) -> EngineResult<Vec<ResultRow>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT file_id, phone_number, e164, is_ios, supports_imessage, supports_sms, contact_type, error, from_cache
                 FROM blooio_results WHERE file_id = $1 ORDER BY id",
                &[&file_id],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let contact_type_str: String = row.get("contact_type");
                ResultRow {
                    file_id: row.get("file_id"),
                    phone_number: row.get("phone_number"),
                    e164: row.get("e164"),
                    is_ios: row.get("is_ios"),
                    supports_imessage: row.get("supports_imessage"),
                    supports_sms: row.get("supports_sms"),
                    contact_type: parse_contact_type(&contact_type_str),
                    error: row.get("error"),
                    from_cache: row.get("from_cache"),
                }
            })
            .collect())
    }

    async fn distinct_e164(&self, file_id: &str) -> EngineResult<HashSet<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT DISTINCT e164 FROM blooio_results WHERE file_id = $1",
                &[&file_id],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    async fn count(&self, file_id: &str) -> EngineResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM blooio_results WHERE file_id = $1",
                &[&file_id],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn delete_one(&self, file_id: &str, e164: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "DELETE FROM blooio_results WHERE file_id = $1 AND e164 = $2",
                &[&file_id, &e164],
            )
            .await?;
        Ok(())
    }
}

fn contact_type_str(ct: ContactType) -> &'static str {
    match ct {
        ContactType::IPhone => "iPhone",
        ContactType::Android => "Android",
        ContactType::Unknown => "Unknown",
        ContactType::Error => "ERROR",
    }
}

fn parse_contact_type(s: &str) -> ContactType {
    match s {
        "iPhone" => ContactType::IPhone,
        "Android" => ContactType::Android,
        "ERROR" => ContactType::Error,
        _ => ContactType::Unknown,
    }
}

/// In-memory fake enforcing I4 (duplicate (file, e164) rejects the batch)
/// the same way the Postgres unique-constraint would.
pub struct InMemoryResultStore {
    rows: Arc<Mutex<HashMap<String, Vec<ResultRow>>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn insert_batch(&self, file_id: &str, rows: Vec<ResultRow>) -> EngineResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut store = self.rows.lock().await;
        let existing = store.entry(file_id.to_string()).or_default();
        let existing_e164: HashSet<&str> = existing.iter().map(|r| r.e164.as_str()).collect();

        let mut seen_in_batch = HashSet::new();
        for row in &rows {
            if existing_e164.contains(row.e164.as_str()) || !seen_in_batch.insert(row.e164.clone()) {
                return Err(EngineError::Invariant(format!(
                    "duplicate result for (file={}, e164={})",
                    file_id, row.e164
                )));
            }
        }

        existing.extend(rows);
        Ok(())
    }

    async fn list(&self, file_id: &str) -> EngineResult<Vec<ResultRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .get(file_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn distinct_e164(&self, file_id: &str) -> EngineResult<HashSet<String>> {
        Ok(self
            .rows
            .lock()
            .await
            .get(file_id)
            .map(|rows| rows.iter().map(|r| r.e164.clone()).collect())
            .unwrap_or_default())
    }

    async fn count(&self, file_id: &str) -> EngineResult<i64> {
        Ok(self
            .rows
            .lock()
            .await
            .get(file_id)
            .map(|rows| rows.len() as i64)
            .unwrap_or(0))
    }

    async fn delete_one(&self, file_id: &str, e164: &str) -> EngineResult<()> {
        if let Some(rows) = self.rows.lock().await.get_mut(file_id) {
            rows.retain(|r| r.e164 != e164);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(file_id: &str, e164: &str) -> ResultRow {
        ResultRow {
            file_id: file_id.to_string(),
            phone_number: e164.to_string(),
            e164: e164.to_string(),
            is_ios: true,
            supports_imessage: true,
            supports_sms: true,
            contact_type: ContactType::IPhone,
            error: None,
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn insert_batch_rejects_duplicate_within_same_file() {
        let store = InMemoryResultStore::new();
        store
            .insert_batch("f1", vec![row("f1", "+15551230000")])
            .await
            .unwrap();

        let err = store
            .insert_batch("f1", vec![row("f1", "+15551230000")])
            .await;
        assert!(err.is_err());

        // The rejected batch must not have partially applied.
        assert_eq!(store.count("f1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_batch_rejects_duplicate_within_itself() {
        let store = InMemoryResultStore::new();
        let err = store
            .insert_batch(
                "f1",
                vec![row("f1", "+15551230001"), row("f1", "+15551230001")],
            )
            .await;
        assert!(err.is_err());
        assert_eq!(store.count("f1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_one_allows_reinsertion() {
        let store = InMemoryResultStore::new();
        store
            .insert_batch("f1", vec![row("f1", "+15551230099")])
            .await
            .unwrap();

        store.delete_one("f1", "+15551230099").await.unwrap();
        assert_eq!(store.count("f1").await.unwrap(), 0);

        store
            .insert_batch("f1", vec![row("f1", "+15551230099")])
            .await
            .unwrap();
        assert_eq!(store.count("f1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn distinct_e164_matches_inserted_rows() {
        let store = InMemoryResultStore::new();
        store
            .insert_batch("f1", vec![row("f1", "+15551230002"), row("f1", "+15551230003")])
            .await
            .unwrap();

        let set = store.distinct_e164("f1").await.unwrap();
        assert_eq!(set.len(), 2);
    }
}
