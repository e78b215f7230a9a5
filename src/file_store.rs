use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineResult;
use crate::models::{FileRecord, FileStatus};

/// The authoritative job descriptor store (`uploaded_files`, §4.1).
/// `acquire_runnable` is what lets a resident worker loop pick a file to
/// work on without a second worker picking the same one.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn insert(&self, file: FileRecord) -> EngineResult<()>;

    async fn get(&self, file_id: &str) -> EngineResult<Option<FileRecord>>;

    /// Claims the next file with `status IN (initialized, processing)` and
    /// `processing_offset < processing_total`, flipping it to `processing`
    /// under lock. Returns `None` if nothing is runnable.
    async fn acquire_runnable(&self) -> EngineResult<Option<FileRecord>>;

    async fn update_progress(
        &self,
        file_id: &str,
        processing_offset: i64,
        last_error: Option<String>,
    ) -> EngineResult<()>;

    async fn mark_completed(&self, file_id: &str, results_url: Option<String>) -> EngineResult<()>;

    async fn mark_failed(&self, file_id: &str, err: &str) -> EngineResult<()>;

    /// Sets status to `processing` unconditionally — used by Repair
    /// Operations after they reconcile the chunk queue.
    async fn mark_processing(&self, file_id: &str) -> EngineResult<()>;

    /// Releases a file a worker picked up but couldn't finish before its
    /// wall-time budget ran out, without marking it failed (§4.6 step g).
    async fn release(&self, file_id: &str) -> EngineResult<()>;

    /// Flips a `failed` file with `can_resume = true` back to `initialized`
    /// so `acquire_runnable` can pick it up again. No-op otherwise.
    async fn resume(&self, file_id: &str) -> EngineResult<()>;

    /// Files still of interest to a caller polling for dashboard display
    /// (§6 `active-files`): `status ∈ {initialized, processing}`, or
    /// `status = failed ∧ can_resume ∧ progress < 100`. Read-only; does not
    /// acquire any lock.
    async fn list_active(&self) -> EngineResult<Vec<FileRecord>>;
}

pub struct PostgresFileStore {
    pool: deadpool_postgres::Pool,
}

impl PostgresFileStore {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileStore for PostgresFileStore {
    async fn insert(&self, file: FileRecord) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO uploaded_files
                 (file_id, file_name, service, processing_total, processing_offset, processing_status, can_resume, last_error, results_url)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &file.file_id,
                    &file.file_name,
                    &file.service,
                    &file.processing_total,
                    &file.processing_offset,
                    &status_str(file.processing_status),
                    &file.can_resume,
                    &file.last_error,
                    &file.results_url,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, file_id: &str) -> EngineResult<Option<FileRecord>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT file_id, file_name, service, processing_total, processing_offset, processing_status, can_resume, last_error, results_url
                 FROM uploaded_files WHERE file_id = $1",
                &[&file_id],
            )
            .await?;
        Ok(row.map(row_to_file))
    }

    async fn acquire_runnable(&self) -> EngineResult<Option<FileRecord>> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        let row = transaction
            .query_opt(
                "SELECT file_id, file_name, service, processing_total, processing_offset, processing_status, can_resume, last_error, results_url
                 FROM uploaded_files
                 WHERE processing_status IN ('initialized', 'processing')
                   AND processing_offset < processing_total
                   AND can_resume
                 ORDER BY file_id ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1",
                &[],
            )
            .await?;

        let Some(row) = row else {
            transaction.rollback().await?;
            return Ok(None);
        };

        let file_id: String = row.get("file_id");
        transaction
            .execute(
                "UPDATE uploaded_files SET processing_status = 'processing' WHERE file_id = $1",
                &[&file_id],
            )
            .await?;
        transaction.commit().await?;

        let mut file = row_to_file(row);
        file.processing_status = FileStatus::Processing;
        Ok(Some(file))
    }

    async fn update_progress(
        &self,
        file_id: &str,
        processing_offset: i64,
        last_error: Option<String>,
    ) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE uploaded_files SET processing_offset = $2, last_error = $3 WHERE file_id = $1",
                &[&file_id, &processing_offset, &last_error],
            )
            .await?;
        Ok(())
    }

    async fn mark_completed(&self, file_id: &str, results_url: Option<String>) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE uploaded_files SET processing_status = 'completed', results_url = $2 WHERE file_id = $1",
                &[&file_id, &results_url],
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, file_id: &str, err: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE uploaded_files SET processing_status = 'failed', last_error = $2 WHERE file_id = $1",
                &[&file_id, &err],
            )
            .await?;
        Ok(())
    }

    async fn release(&self, file_id: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE uploaded_files SET processing_status = 'initialized' WHERE file_id = $1 AND processing_status = 'processing'",
                &[&file_id],
            )
            .await?;
        Ok(())
    }

    async fn mark_processing(&self, file_id: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE uploaded_files SET processing_status = 'processing' WHERE file_id = $1",
                &[&file_id],
            )
            .await?;
        Ok(())
    }

    async fn resume(&self, file_id: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE uploaded_files SET processing_status = 'initialized'
                 WHERE file_id = $1 AND processing_status = 'failed' AND can_resume",
                &[&file_id],
            )
            .await?;
        Ok(())
    }

    async fn list_active(&self) -> EngineResult<Vec<FileRecord>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT file_id, file_name, service, processing_total, processing_offset, processing_status, can_resume, last_error, results_url
                 FROM uploaded_files
                 WHERE processing_status IN ('initialized', 'processing')
                    OR (processing_status = 'failed' AND can_resume AND processing_offset < processing_total)",
                &[],
            )
            .await?;
        Ok(rows.into_iter().map(row_to_file).collect())
    }
}

fn status_str(s: FileStatus) -> &'static str {
    match s {
        FileStatus::Uploading => "uploading",
        FileStatus::Initialized => "initialized",
        FileStatus::Processing => "processing",
        FileStatus::Completed => "completed",
        FileStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> FileStatus {
    match s {
        "uploading" => FileStatus::Uploading,
        "processing" => FileStatus::Processing,
        "completed" => FileStatus::Completed,
        "failed" => FileStatus::Failed,
        _ => FileStatus::Initialized,
    }
}

fn row_to_file(row: tokio_postgres::Row) -> FileRecord {
    let status_str: String = row.get("processing_status");
    FileRecord {
        file_id: row.get("file_id"),
        file_name: row.get("file_name"),
        service: row.get("service"),
        processing_total: row.get("processing_total"),
        processing_offset: row.get("processing_offset"),
        processing_status: parse_status(&status_str),
        can_resume: row.get("can_resume"),
        last_error: row.get("last_error"),
        results_url: row.get("results_url"),
    }
}

/// In-memory fake. Same single-`Mutex` locking story as `InMemoryChunkStore`.
pub struct InMemoryFileStore {
    files: Arc<Mutex<HashMap<String, FileRecord>>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn insert(&self, file: FileRecord) -> EngineResult<()> {
        self.files.lock().await.insert(file.file_id.clone(), file);
        Ok(())
    }

    async fn get(&self, file_id: &str) -> EngineResult<Option<FileRecord>> {
        Ok(self.files.lock().await.get(file_id).cloned())
    }

    async fn acquire_runnable(&self) -> EngineResult<Option<FileRecord>> {
        let mut files = self.files.lock().await;
        let mut candidate_id: Option<String> = None;
        for (id, f) in files.iter() {
            if matches!(f.processing_status, FileStatus::Initialized | FileStatus::Processing)
                && f.processing_offset < f.processing_total
                && f.can_resume
            {
                candidate_id = match candidate_id {
                    Some(ref current) if current.as_str() <= id.as_str() => candidate_id,
                    _ => Some(id.clone()),
                };
            }
        }

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let file = files.get_mut(&id).unwrap();
        file.processing_status = FileStatus::Processing;
        Ok(Some(file.clone()))
    }

    async fn update_progress(
        &self,
        file_id: &str,
        processing_offset: i64,
        last_error: Option<String>,
    ) -> EngineResult<()> {
        if let Some(f) = self.files.lock().await.get_mut(file_id) {
            f.processing_offset = processing_offset;
            f.last_error = last_error;
        }
        Ok(())
    }

    async fn mark_completed(&self, file_id: &str, results_url: Option<String>) -> EngineResult<()> {
        if let Some(f) = self.files.lock().await.get_mut(file_id) {
            f.processing_status = FileStatus::Completed;
            f.results_url = results_url;
        }
        Ok(())
    }

    async fn mark_failed(&self, file_id: &str, err: &str) -> EngineResult<()> {
        if let Some(f) = self.files.lock().await.get_mut(file_id) {
            f.processing_status = FileStatus::Failed;
            f.last_error = Some(err.to_string());
        }
        Ok(())
    }

    async fn release(&self, file_id: &str) -> EngineResult<()> {
        if let Some(f) = self.files.lock().await.get_mut(file_id) {
            if f.processing_status == FileStatus::Processing {
                f.processing_status = FileStatus::Initialized;
            }
        }
        Ok(())
    }

    async fn mark_processing(&self, file_id: &str) -> EngineResult<()> {
        if let Some(f) = self.files.lock().await.get_mut(file_id) {
            f.processing_status = FileStatus::Processing;
        }
        Ok(())
    }

    async fn resume(&self, file_id: &str) -> EngineResult<()> {
        if let Some(f) = self.files.lock().await.get_mut(file_id) {
            if f.processing_status == FileStatus::Failed && f.can_resume {
                f.processing_status = FileStatus::Initialized;
            }
        }
        Ok(())
    }

    async fn list_active(&self) -> EngineResult<Vec<FileRecord>> {
        Ok(self
            .files
            .lock()
            .await
            .values()
            .filter(|f| {
                matches!(f.processing_status, FileStatus::Initialized | FileStatus::Processing)
                    || (f.processing_status == FileStatus::Failed
                        && f.can_resume
                        && f.processing_offset < f.processing_total)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, total: i64, offset: i64, status: FileStatus) -> FileRecord {
        FileRecord {
            file_id: id.to_string(),
            file_name: format!("{id}.csv"),
            service: "blooio".to_string(),
            processing_total: total,
            processing_offset: offset,
            processing_status: status,
            can_resume: true,
            last_error: None,
            results_url: None,
        }
    }

    #[tokio::test]
    async fn acquire_runnable_skips_completed_and_exhausted_files() {
        let store = InMemoryFileStore::new();
        store
            .insert(file("f1", 10, 10, FileStatus::Processing))
            .await
            .unwrap();
        store
            .insert(file("f2", 10, 3, FileStatus::Initialized))
            .await
            .unwrap();

        let acquired = store.acquire_runnable().await.unwrap().unwrap();
        assert_eq!(acquired.file_id, "f2");
        assert_eq!(acquired.processing_status, FileStatus::Processing);
    }

    #[tokio::test]
    async fn acquire_runnable_skips_files_that_cannot_resume() {
        let store = InMemoryFileStore::new();
        let mut f = file("f1", 10, 3, FileStatus::Initialized);
        f.can_resume = false;
        store.insert(f).await.unwrap();

        assert!(store.acquire_runnable().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_progress_and_mark_completed() {
        let store = InMemoryFileStore::new();
        store
            .insert(file("f1", 10, 0, FileStatus::Initialized))
            .await
            .unwrap();

        store.update_progress("f1", 10, None).await.unwrap();
        store
            .mark_completed("f1", Some("https://example.com/r.csv".to_string()))
            .await
            .unwrap();

        let f = store.get("f1").await.unwrap().unwrap();
        assert_eq!(f.processing_status, FileStatus::Completed);
        assert_eq!(f.processing_offset, 10);
        assert!(f.results_url.is_some());
    }

    #[tokio::test]
    async fn release_returns_processing_file_to_initialized() {
        let store = InMemoryFileStore::new();
        store
            .insert(file("f1", 10, 3, FileStatus::Processing))
            .await
            .unwrap();

        store.release("f1").await.unwrap();
        let f = store.get("f1").await.unwrap().unwrap();
        assert_eq!(f.processing_status, FileStatus::Initialized);
    }

    #[tokio::test]
    async fn resume_reinitializes_a_resumable_failed_file() {
        let store = InMemoryFileStore::new();
        store
            .insert(file("f1", 10, 3, FileStatus::Failed))
            .await
            .unwrap();

        store.resume("f1").await.unwrap();
        let f = store.get("f1").await.unwrap().unwrap();
        assert_eq!(f.processing_status, FileStatus::Initialized);
    }

    #[tokio::test]
    async fn resume_is_a_noop_when_can_resume_is_false() {
        let store = InMemoryFileStore::new();
        let mut f = file("f1", 10, 3, FileStatus::Failed);
        f.can_resume = false;
        store.insert(f).await.unwrap();

        store.resume("f1").await.unwrap();
        let f = store.get("f1").await.unwrap().unwrap();
        assert_eq!(f.processing_status, FileStatus::Failed);
    }

    #[tokio::test]
    async fn list_active_includes_resumable_failures_but_not_completed_or_dead_ones() {
        let store = InMemoryFileStore::new();
        store.insert(file("running", 10, 3, FileStatus::Processing)).await.unwrap();
        store.insert(file("queued", 10, 0, FileStatus::Initialized)).await.unwrap();
        store.insert(file("done", 10, 10, FileStatus::Completed)).await.unwrap();

        let mut resumable = file("resumable", 10, 3, FileStatus::Failed);
        resumable.can_resume = true;
        store.insert(resumable).await.unwrap();

        let mut dead = file("dead", 10, 3, FileStatus::Failed);
        dead.can_resume = false;
        store.insert(dead).await.unwrap();

        let active: std::collections::HashSet<String> = store
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.file_id)
            .collect();

        assert_eq!(
            active,
            ["running", "queued", "resumable"]
                .into_iter()
                .map(String::from)
                .collect()
        );
    }
}
