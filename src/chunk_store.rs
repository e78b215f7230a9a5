use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineResult;
use crate::models::{Chunk, ChunkStatus, PhoneRecord};

/// Persistent FIFO-ish work queue per file (§4.4). `acquire_next` is the
/// linchpin of invariant I3: the row lock and the `pending|failed →
/// processing` flip happen in one transaction, so two workers can never hold
/// the same chunk.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Inserts a new `pending` chunk and returns its id.
    async fn insert_pending(
        &self,
        file_id: &str,
        chunk_offset: i64,
        chunk_data: Vec<PhoneRecord>,
    ) -> EngineResult<i64>;

    /// Atomically claims the next runnable chunk for `file_id` and flips it
    /// to `processing`. Ordering: pending before failed, then
    /// `chunk_offset` ascending. Only chunks with `retry_count < max_retries`
    /// are eligible.
    async fn acquire_next(&self, file_id: &str, max_retries: u32) -> EngineResult<Option<Chunk>>;

    async fn complete(&self, chunk_id: i64) -> EngineResult<()>;

    /// Increments `retry_count`; transitions to `failed` if still under
    /// `max_retries`, else `failed_permanent`.
    async fn fail(&self, chunk_id: i64, max_retries: u32, err: &str) -> EngineResult<()>;

    /// Marks `original` completed and, provided `remaining_capacity` (the
    /// unused slack in `processing_total`) can hold the unconsumed tail of
    /// the payload, inserts a fresh `pending` chunk with that tail. Returns
    /// whether a split chunk was created.
    async fn split(
        &self,
        original: &Chunk,
        processed_k: usize,
        remaining_capacity: i64,
    ) -> EngineResult<bool>;

    /// Flips any `processing` chunks for `file_id` back to `pending` —
    /// recovery from a prior crash, run once at worker startup per file.
    async fn reset_stuck(&self, file_id: &str) -> EngineResult<()>;

    /// True if no chunk for `file_id` is in a non-terminal status
    /// (`pending`, `processing`, `failed`) — used by the worker's
    /// completion check (I1).
    async fn all_terminal(&self, file_id: &str) -> EngineResult<bool>;

    /// All chunks for a file, regardless of status — used by Repair to
    /// union payloads across every chunk ever created (including
    /// `failed_permanent` ones, see DESIGN.md Open Question #2).
    async fn all_chunks(&self, file_id: &str) -> EngineResult<Vec<Chunk>>;

    /// Deletes every chunk for a file — used by `rebuild-chunks`.
    async fn delete_all(&self, file_id: &str) -> EngineResult<()>;

    /// Deletes only `pending` chunks for a file — used by `cancel`. Chunks
    /// already `processing` are left for the in-flight worker to finish its
    /// current phone; it will not re-pick the file once cancelled.
    async fn delete_pending(&self, file_id: &str) -> EngineResult<()>;

    /// The highest `chunk_offset` in use for a file, so `create-missing-chunks`
    /// can append without clashing (§4.7).
    async fn max_chunk_offset(&self, file_id: &str) -> EngineResult<i64>;
}

pub struct PostgresChunkStore {
    pool: deadpool_postgres::Pool,
}

impl PostgresChunkStore {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChunkStore for PostgresChunkStore {
    async fn insert_pending(
        &self,
        file_id: &str,
        chunk_offset: i64,
        chunk_data: Vec<PhoneRecord>,
    ) -> EngineResult<i64> {
        let client = self.pool.get().await?;
        let payload = serde_json::to_value(&chunk_data)?;
        let row = client
            .query_one(
                "INSERT INTO processing_chunks (file_id, chunk_offset, chunk_data, chunk_status, retry_count)
                 VALUES ($1, $2, $3, 'pending', 0) RETURNING chunk_id",
                &[&file_id, &chunk_offset, &payload],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn acquire_next(&self, file_id: &str, max_retries: u32) -> EngineResult<Option<Chunk>> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        let row = transaction
            .query_opt(
                "SELECT chunk_id, file_id, chunk_offset, chunk_data, chunk_status, retry_count
                 FROM processing_chunks
                 WHERE file_id = $1 AND chunk_status IN ('pending', 'failed') AND retry_count < $2
                 ORDER BY (chunk_status = 'pending') DESC, chunk_offset ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1",
                &[&file_id, &(max_retries as i32)],
            )
            .await?;

        let Some(row) = row else {
            transaction.rollback().await?;
            return Ok(None);
        };

        let chunk_id: i64 = row.get("chunk_id");
        transaction
            .execute(
                "UPDATE processing_chunks SET chunk_status = 'processing' WHERE chunk_id = $1",
                &[&chunk_id],
            )
            .await?;

        let payload: serde_json::Value = row.get("chunk_data");
        let chunk_data: Vec<PhoneRecord> = serde_json::from_value(payload)?;

        transaction.commit().await?;

        Ok(Some(Chunk {
            chunk_id,
            file_id: row.get("file_id"),
            chunk_offset: row.get("chunk_offset"),
            chunk_data,
            chunk_status: ChunkStatus::Processing,
            retry_count: row.get("retry_count"),
        }))
    }

    async fn complete(&self, chunk_id: i64) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE processing_chunks SET chunk_status = 'completed' WHERE chunk_id = $1",
                &[&chunk_id],
            )
            .await?;
        Ok(())
    }

    async fn fail(&self, chunk_id: i64, max_retries: u32, err: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE processing_chunks
                 SET retry_count = retry_count + 1,
                     chunk_status = CASE WHEN retry_count + 1 < $2 THEN 'failed' ELSE 'failed_permanent' END,
                     last_error = $3
                 WHERE chunk_id = $1",
                &[&chunk_id, &(max_retries as i32), &err],
            )
            .await?;
        Ok(())
    }

    async fn split(
        &self,
        original: &Chunk,
        processed_k: usize,
        remaining_capacity: i64,
    ) -> EngineResult<bool> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        // Truncate the stored payload to what was actually processed —
        // otherwise a later `rebuild-chunks`/`create-missing-chunks` union
        // over `all_chunks` would see this completed row's full original
        // phones *and* the tail chunk below, double-counting the split-off
        // suffix.
        let processed_payload = serde_json::to_value(&original.chunk_data[..processed_k])?;
        transaction
            .execute(
                "UPDATE processing_chunks SET chunk_status = 'completed', chunk_data = $2 WHERE chunk_id = $1",
                &[&original.chunk_id, &processed_payload],
            )
            .await?;

        let tail: Vec<PhoneRecord> = original.chunk_data[processed_k..].to_vec();
        let created = if (tail.len() as i64) <= remaining_capacity && !tail.is_empty() {
            let payload = serde_json::to_value(&tail)?;
            transaction
                .execute(
                    "INSERT INTO processing_chunks (file_id, chunk_offset, chunk_data, chunk_status, retry_count)
                     VALUES ($1, $2, $3, 'pending', 0)",
                    &[
                        &original.file_id,
                        &(original.chunk_offset + processed_k as i64),
                        &payload,
                    ],
                )
                .await?;
            true
        } else {
            false
        };

        transaction.commit().await?;
        Ok(created)
    }

    async fn reset_stuck(&self, file_id: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE processing_chunks SET chunk_status = 'pending'
                 WHERE file_id = $1 AND chunk_status = 'processing'",
                &[&file_id],
            )
            .await?;
        Ok(())
    }

    async fn all_terminal(&self, file_id: &str) -> EngineResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM processing_chunks
                 WHERE file_id = $1 AND chunk_status IN ('pending', 'processing', 'failed')",
                &[&file_id],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count == 0)
    }

    async fn all_chunks(&self, file_id: &str) -> EngineResult<Vec<Chunk>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT chunk_id, file_id, chunk_offset, chunk_data, chunk_status, retry_count
                 FROM processing_chunks WHERE file_id = $1 ORDER BY chunk_offset ASC",
                &[&file_id],
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let status_str: String = row.get("chunk_status");
                let payload: serde_json::Value = row.get("chunk_data");
                let chunk_data: Vec<PhoneRecord> = serde_json::from_value(payload)?;
                Ok(Chunk {
                    chunk_id: row.get("chunk_id"),
                    file_id: row.get("file_id"),
                    chunk_offset: row.get("chunk_offset"),
                    chunk_data,
                    chunk_status: parse_status(&status_str),
                    retry_count: row.get("retry_count"),
                })
            })
            .collect()
    }

    async fn delete_all(&self, file_id: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute("DELETE FROM processing_chunks WHERE file_id = $1", &[&file_id])
            .await?;
        Ok(())
    }

    async fn delete_pending(&self, file_id: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "DELETE FROM processing_chunks WHERE file_id = $1 AND chunk_status = 'pending'",
                &[&file_id],
            )
            .await?;
        Ok(())
    }

    async fn max_chunk_offset(&self, file_id: &str) -> EngineResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COALESCE(MAX(chunk_offset), 0) FROM processing_chunks WHERE file_id = $1",
                &[&file_id],
            )
            .await?;
        Ok(row.get(0))
    }
}

fn parse_status(s: &str) -> ChunkStatus {
    match s {
        "pending" => ChunkStatus::Pending,
        "processing" => ChunkStatus::Processing,
        "completed" => ChunkStatus::Completed,
        "failed" => ChunkStatus::Failed,
        _ => ChunkStatus::FailedPermanent,
    }
}

/// In-memory fake. A single `Mutex` around the whole table stands in for row
/// locking — good enough to test I3 (no double-acquire) under concurrent
/// task interleaving within one process.
pub struct InMemoryChunkStore {
    chunks: Arc<Mutex<HashMap<i64, Chunk>>>,
    next_id: AtomicI64,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self {
            chunks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn insert_pending(
        &self,
        file_id: &str,
        chunk_offset: i64,
        chunk_data: Vec<PhoneRecord>,
    ) -> EngineResult<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let chunk = Chunk {
            chunk_id: id,
            file_id: file_id.to_string(),
            chunk_offset,
            chunk_data,
            chunk_status: ChunkStatus::Pending,
            retry_count: 0,
        };
        self.chunks.lock().await.insert(id, chunk);
        Ok(id)
    }

    async fn acquire_next(&self, file_id: &str, max_retries: u32) -> EngineResult<Option<Chunk>> {
        let mut chunks = self.chunks.lock().await;
        let candidate_id = chunks
            .values()
            .filter(|c| {
                c.file_id == file_id
                    && matches!(c.chunk_status, ChunkStatus::Pending | ChunkStatus::Failed)
                    && (c.retry_count as u32) < max_retries
            })
            .min_by_key(|c| {
                let rank = if c.chunk_status == ChunkStatus::Pending {
                    0
                } else {
                    1
                };
                (rank, c.chunk_offset)
            })
            .map(|c| c.chunk_id);

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let chunk = chunks.get_mut(&id).unwrap();
        chunk.chunk_status = ChunkStatus::Processing;
        Ok(Some(chunk.clone()))
    }

    async fn complete(&self, chunk_id: i64) -> EngineResult<()> {
        if let Some(c) = self.chunks.lock().await.get_mut(&chunk_id) {
            c.chunk_status = ChunkStatus::Completed;
        }
        Ok(())
    }

    async fn fail(&self, chunk_id: i64, max_retries: u32, _err: &str) -> EngineResult<()> {
        if let Some(c) = self.chunks.lock().await.get_mut(&chunk_id) {
            c.retry_count += 1;
            c.chunk_status = if (c.retry_count as u32) < max_retries {
                ChunkStatus::Failed
            } else {
                ChunkStatus::FailedPermanent
            };
        }
        Ok(())
    }

    async fn split(
        &self,
        original: &Chunk,
        processed_k: usize,
        remaining_capacity: i64,
    ) -> EngineResult<bool> {
        let mut chunks = self.chunks.lock().await;
        if let Some(c) = chunks.get_mut(&original.chunk_id) {
            c.chunk_status = ChunkStatus::Completed;
            c.chunk_data.truncate(processed_k);
        }

        let tail: Vec<PhoneRecord> = original.chunk_data[processed_k..].to_vec();
        if tail.is_empty() || (tail.len() as i64) > remaining_capacity {
            return Ok(false);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        chunks.insert(
            id,
            Chunk {
                chunk_id: id,
                file_id: original.file_id.clone(),
                chunk_offset: original.chunk_offset + processed_k as i64,
                chunk_data: tail,
                chunk_status: ChunkStatus::Pending,
                retry_count: 0,
            },
        );
        Ok(true)
    }

    async fn reset_stuck(&self, file_id: &str) -> EngineResult<()> {
        let mut chunks = self.chunks.lock().await;
        for c in chunks.values_mut() {
            if c.file_id == file_id && c.chunk_status == ChunkStatus::Processing {
                c.chunk_status = ChunkStatus::Pending;
            }
        }
        Ok(())
    }

    async fn all_terminal(&self, file_id: &str) -> EngineResult<bool> {
        let chunks = self.chunks.lock().await;
        Ok(chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .all(|c| c.chunk_status.is_terminal()))
    }

    async fn all_chunks(&self, file_id: &str) -> EngineResult<Vec<Chunk>> {
        let chunks = self.chunks.lock().await;
        let mut out: Vec<Chunk> = chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.chunk_offset);
        Ok(out)
    }

    async fn delete_all(&self, file_id: &str) -> EngineResult<()> {
        self.chunks.lock().await.retain(|_, c| c.file_id != file_id);
        Ok(())
    }

    async fn delete_pending(&self, file_id: &str) -> EngineResult<()> {
        self.chunks
            .lock()
            .await
            .retain(|_, c| !(c.file_id == file_id && c.chunk_status == ChunkStatus::Pending));
        Ok(())
    }

    async fn max_chunk_offset(&self, file_id: &str) -> EngineResult<i64> {
        let chunks = self.chunks.lock().await;
        Ok(chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .map(|c| c.chunk_offset)
            .max()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phones(n: usize) -> Vec<PhoneRecord> {
        (0..n)
            .map(|i| PhoneRecord {
                original: format!("phone-{i}"),
                e164: format!("+1555000{i:04}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn acquire_next_orders_pending_before_failed() {
        let store = InMemoryChunkStore::new();
        let failed_id = store.insert_pending("f1", 0, phones(2)).await.unwrap();
        store.fail(failed_id, 3, "boom").await.unwrap();
        let pending_id = store.insert_pending("f1", 2, phones(2)).await.unwrap();

        let acquired = store.acquire_next("f1", 3).await.unwrap().unwrap();
        assert_eq!(acquired.chunk_id, pending_id);
    }

    #[tokio::test]
    async fn acquire_next_excludes_exhausted_retries() {
        let store = InMemoryChunkStore::new();
        let id = store.insert_pending("f1", 0, phones(1)).await.unwrap();
        store.fail(id, 1, "boom").await.unwrap(); // retry_count=1, max_retries=1 -> failed_permanent

        let acquired = store.acquire_next("f1", 1).await.unwrap();
        assert!(acquired.is_none());
    }

    #[tokio::test]
    async fn acquire_next_is_exclusive() {
        let store = Arc::new(InMemoryChunkStore::new());
        store.insert_pending("f1", 0, phones(1)).await.unwrap();

        let a = store.acquire_next("f1", 3).await.unwrap();
        let b = store.acquire_next("f1", 3).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_none(), "same chunk must not be acquired twice");
    }

    #[tokio::test]
    async fn split_creates_tail_chunk_when_capacity_allows() {
        let store = InMemoryChunkStore::new();
        let id = store.insert_pending("f1", 0, phones(5)).await.unwrap();
        let chunk = store.acquire_next("f1", 3).await.unwrap().unwrap();
        assert_eq!(chunk.chunk_id, id);

        let created = store.split(&chunk, 3, 2).await.unwrap();
        assert!(created);

        let all = store.all_chunks("f1").await.unwrap();
        assert_eq!(all.len(), 2);
        let tail = all.iter().find(|c| c.chunk_id != id).unwrap();
        assert_eq!(tail.chunk_data.len(), 2);
        assert_eq!(tail.chunk_offset, 3);
        assert_eq!(tail.chunk_status, ChunkStatus::Pending);

        let original = all.iter().find(|c| c.chunk_id == id).unwrap();
        assert_eq!(
            original.chunk_data.len(),
            3,
            "completed original must be truncated to what it actually processed"
        );
    }

    #[tokio::test]
    async fn split_suppressed_when_i5_would_be_violated() {
        let store = InMemoryChunkStore::new();
        let id = store.insert_pending("f1", 0, phones(5)).await.unwrap();
        let chunk = store.acquire_next("f1", 3).await.unwrap().unwrap();

        // remaining_capacity smaller than the tail -> must suppress
        let created = store.split(&chunk, 3, 1).await.unwrap();
        assert!(!created);

        let all = store.all_chunks("f1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].chunk_status, ChunkStatus::Completed);
        assert_eq!(all[0].chunk_data.len(), 3, "truncation happens regardless of whether a tail chunk is created");
    }

    #[tokio::test]
    async fn reset_stuck_reclaims_processing_chunks() {
        let store = InMemoryChunkStore::new();
        store.insert_pending("f1", 0, phones(1)).await.unwrap();
        store.acquire_next("f1", 3).await.unwrap();

        store.reset_stuck("f1").await.unwrap();
        let all = store.all_chunks("f1").await.unwrap();
        assert_eq!(all[0].chunk_status, ChunkStatus::Pending);
    }

    #[tokio::test]
    async fn delete_pending_leaves_processing_chunks_in_place() {
        let store = InMemoryChunkStore::new();
        let in_flight = store.insert_pending("f1", 0, phones(1)).await.unwrap();
        store.insert_pending("f1", 1, phones(1)).await.unwrap();
        store.acquire_next("f1", 3).await.unwrap(); // claims offset 0, leaves offset 1 pending

        store.delete_pending("f1").await.unwrap();

        let all = store.all_chunks("f1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].chunk_id, in_flight);
        assert_eq!(all[0].chunk_status, ChunkStatus::Processing);
    }
}
