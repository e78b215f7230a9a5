use log::info;
use std::sync::Arc;

use crate::cache_store::CacheStore;
use crate::chunk_store::ChunkStore;
use crate::classifier::Classifier;
use crate::error::EngineResult;
use crate::file_store::FileStore;
use crate::models::{PhoneRecord, ResultRow};
use crate::result_store::ResultStore;

/// Administrative, idempotent reconciliation procedures (§4.7). Each takes a
/// file id and must preserve I1–I5.
pub struct RepairOperations {
    file_store: Arc<dyn FileStore>,
    chunk_store: Arc<dyn ChunkStore>,
    result_store: Arc<dyn ResultStore>,
    cache_store: Arc<dyn CacheStore>,
    classifier: Classifier,
    chunk_size: usize,
}

impl RepairOperations {
    pub fn new(
        file_store: Arc<dyn FileStore>,
        chunk_store: Arc<dyn ChunkStore>,
        result_store: Arc<dyn ResultStore>,
        cache_store: Arc<dyn CacheStore>,
        classifier: Classifier,
        chunk_size: usize,
    ) -> Self {
        Self {
            file_store,
            chunk_store,
            result_store,
            cache_store,
            classifier,
            chunk_size,
        }
    }

    /// Unions every chunk payload for the file regardless of status
    /// (including `failed_permanent`), drops everything already in the
    /// Result Store, deletes the existing queue, and rebuilds it from
    /// scratch with the unprocessed remainder.
    pub async fn rebuild_chunks(&self, file_id: &str) -> EngineResult<()> {
        let existing = self.chunk_store.all_chunks(file_id).await?;
        let all_phones: Vec<PhoneRecord> = existing.into_iter().flat_map(|c| c.chunk_data).collect();
        let already_processed = self.result_store.distinct_e164(file_id).await?;

        let unprocessed: Vec<PhoneRecord> = all_phones
            .into_iter()
            .filter(|p| !already_processed.contains(&p.e164))
            .collect();

        self.chunk_store.delete_all(file_id).await?;

        let mut offset: i64 = 0;
        for batch in unprocessed.chunks(self.chunk_size.max(1)) {
            self.chunk_store
                .insert_pending(file_id, offset, batch.to_vec())
                .await?;
            offset += batch.len() as i64;
        }

        self.file_store
            .update_progress(file_id, already_processed.len() as i64, None)
            .await?;
        self.file_store.mark_processing(file_id).await?;

        info!(
            "rebuilt chunk queue for file {}: {} already processed, {} requeued",
            file_id,
            already_processed.len(),
            offset
        );
        Ok(())
    }

    /// Same diagnosis as `rebuild_chunks` but appends new pending chunks for
    /// the unprocessed remainder at a fresh offset range instead of
    /// replacing the existing queue.
    pub async fn create_missing_chunks(&self, file_id: &str) -> EngineResult<()> {
        let existing = self.chunk_store.all_chunks(file_id).await?;
        let all_phones: Vec<PhoneRecord> = existing
            .iter()
            .flat_map(|c| c.chunk_data.clone())
            .collect();
        let already_processed = self.result_store.distinct_e164(file_id).await?;

        let unprocessed: Vec<PhoneRecord> = all_phones
            .into_iter()
            .filter(|p| !already_processed.contains(&p.e164))
            .collect();

        if unprocessed.is_empty() {
            info!("create-missing-chunks found nothing unprocessed for file {file_id}");
            return Ok(());
        }

        let mut offset = self.chunk_store.max_chunk_offset(file_id).await? + 1;
        for batch in unprocessed.chunks(self.chunk_size.max(1)) {
            self.chunk_store
                .insert_pending(file_id, offset, batch.to_vec())
                .await?;
            offset += batch.len() as i64;
        }

        info!("create-missing-chunks appended chunks for file {file_id} starting at offset {offset}");
        Ok(())
    }

    /// User-initiated cancellation (§5): deletes pending queue entries and
    /// marks the file `failed`. Chunks already `processing` are left for the
    /// in-flight worker to finish their current phone — it observes the
    /// status change on its next progress update and does not re-pick the
    /// file.
    pub async fn cancel(&self, file_id: &str) -> EngineResult<()> {
        self.chunk_store.delete_pending(file_id).await?;
        self.file_store
            .mark_failed(file_id, "cancelled by operator")
            .await?;
        info!("cancelled file {file_id}");
        Ok(())
    }

    /// Reinitializes a cancelled or failed-but-resumable file so the Chunk
    /// Worker picks it up again. No-op if the file isn't `failed` or has
    /// `can_resume = false`.
    pub async fn resume(&self, file_id: &str) -> EngineResult<()> {
        self.file_store.resume(file_id).await?;
        info!("resumed file {file_id}");
        Ok(())
    }

    /// Drops any existing Result row and CacheEntry for `record`, then
    /// synchronously re-classifies it.
    pub async fn reprocess_single(
        &self,
        file_id: &str,
        record: &PhoneRecord,
    ) -> EngineResult<ResultRow> {
        self.result_store.delete_one(file_id, &record.e164).await?;
        self.cache_store.invalidate(&record.e164).await?;

        let verdict = self.classifier.classify(record).await?;
        let row = verdict.into_result_row(file_id, record);
        self.result_store
            .insert_batch(file_id, vec![row.clone()])
            .await?;
        Ok(row)
    }
}
