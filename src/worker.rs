use log::{info, warn};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use crate::chunk_store::ChunkStore;
use crate::classifier::Classifier;
use crate::error::EngineResult;
use crate::file_store::FileStore;
use crate::models::ResultRow;
use crate::quality_check;
use crate::result_store::ResultStore;

/// Outcome of one `process_queue_tick` invocation, reported for logging and
/// tests rather than acted on by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub file_id: Option<String>,
    pub chunks_completed: u32,
    pub chunks_split: u32,
    pub chunks_failed: u32,
    pub file_completed: bool,
}

impl TickOutcome {
    fn idle() -> Self {
        Self {
            file_id: None,
            chunks_completed: 0,
            chunks_split: 0,
            chunks_failed: 0,
            file_completed: false,
        }
    }
}

/// The engine's main loop (§4.6): claim one runnable file, drain its chunk
/// queue within a bounded wall-clock budget, and leave it resumable or mark
/// it completed.
pub struct ChunkWorker {
    file_store: Arc<dyn FileStore>,
    chunk_store: Arc<dyn ChunkStore>,
    result_store: Arc<dyn ResultStore>,
    classifier: Classifier,
    max_retries: u32,
    max_wall_time: Duration,
}

impl ChunkWorker {
    pub fn new(
        file_store: Arc<dyn FileStore>,
        chunk_store: Arc<dyn ChunkStore>,
        result_store: Arc<dyn ResultStore>,
        classifier: Classifier,
        max_retries: u32,
        max_wall_time: Duration,
    ) -> Self {
        Self {
            file_store,
            chunk_store,
            result_store,
            classifier,
            max_retries,
            max_wall_time,
        }
    }

    pub async fn process_queue_tick(&self) -> EngineResult<TickOutcome> {
        let Some(mut file) = self.file_store.acquire_runnable().await? else {
            return Ok(TickOutcome::idle());
        };

        info!("acquired file {} for processing", file.file_id);
        self.chunk_store.reset_stuck(&file.file_id).await?;

        let mut outcome = TickOutcome {
            file_id: Some(file.file_id.clone()),
            ..TickOutcome::idle()
        };

        let start = Instant::now();

        // Populated once per tick and extended as this invocation durably
        // writes more results, so a chunk reclaimed by `reset_stuck` after a
        // crash (left with its original, unsliced payload) never re-submits
        // phones already recorded in the Result Store — `insert_batch` is
        // all-or-nothing, so a single stale duplicate would reject an
        // otherwise-fresh batch and spuriously burn a retry.
        let mut already_processed = self.result_store.distinct_e164(&file.file_id).await?;

        while start.elapsed() < self.max_wall_time {
            let Some(chunk) = self
                .chunk_store
                .acquire_next(&file.file_id, self.max_retries)
                .await?
            else {
                break;
            };

            info!(
                "acquired chunk {} (offset {}, {} phones) for file {}",
                chunk.chunk_id,
                chunk.chunk_offset,
                chunk.chunk_data.len(),
                file.file_id
            );

            let mut batch_results: Vec<ResultRow> = Vec::with_capacity(chunk.chunk_data.len());
            let mut processed_k = 0usize;

            for record in &chunk.chunk_data {
                if start.elapsed() >= self.max_wall_time {
                    break;
                }
                if already_processed.contains(&record.e164) {
                    processed_k += 1;
                    continue;
                }
                let verdict = self.classifier.classify(record).await?;
                batch_results.push(verdict.into_result_row(&file.file_id, record));
                processed_k += 1;
            }

            if !batch_results.is_empty() {
                let new_e164: Vec<String> = batch_results.iter().map(|r| r.e164.clone()).collect();
                if let Err(err) = self
                    .result_store
                    .insert_batch(&file.file_id, batch_results)
                    .await
                {
                    warn!(
                        "failed to persist results for chunk {}: {}",
                        chunk.chunk_id, err
                    );
                    self.chunk_store
                        .fail(chunk.chunk_id, self.max_retries, &err.to_string())
                        .await?;
                    self.file_store
                        .update_progress(&file.file_id, file.processing_offset, Some(err.to_string()))
                        .await?;
                    outcome.chunks_failed += 1;
                    break;
                }
                already_processed.extend(new_e164);
            }

            if processed_k == chunk.chunk_data.len() {
                self.chunk_store.complete(chunk.chunk_id).await?;
                outcome.chunks_completed += 1;
            } else if processed_k > 0 {
                let remaining_capacity =
                    file.processing_total - (file.processing_offset + processed_k as i64);
                let split = self
                    .chunk_store
                    .split(&chunk, processed_k, remaining_capacity)
                    .await?;
                outcome.chunks_split += u32::from(split);
            } else {
                // The wall-time budget ran out before a single phone in this
                // chunk was classified. Leave it in `processing` rather than
                // calling split/complete on an empty contribution — the next
                // invocation's `reset_stuck` reclaims it.
                break;
            }

            if processed_k > 0 {
                file.processing_offset += processed_k as i64;
                self.file_store
                    .update_progress(&file.file_id, file.processing_offset, None)
                    .await?;
            }

            if start.elapsed() >= self.max_wall_time {
                break;
            }
        }

        let refreshed = self
            .file_store
            .get(&file.file_id)
            .await?
            .unwrap_or(file.clone());

        if refreshed.processing_offset >= refreshed.processing_total
            && self.chunk_store.all_terminal(&refreshed.file_id).await?
        {
            let results = self.result_store.list(&refreshed.file_id).await?;
            let summary = quality_check::check(&refreshed.file_id, &results);
            info!(
                "file {} completed: iPhone={:.2}% Android={:.2}% Unknown={:.2}% Error={:.2}%",
                refreshed.file_id,
                summary.iphone_pct,
                summary.android_pct,
                summary.unknown_pct,
                summary.error_pct
            );
            self.file_store
                .mark_completed(&refreshed.file_id, refreshed.results_url.clone())
                .await?;
            outcome.file_completed = true;
        } else {
            info!(
                "file {} left in progress at offset {}/{}",
                refreshed.file_id, refreshed.processing_offset, refreshed.processing_total
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::InMemoryCacheStore;
    use crate::chunk_store::InMemoryChunkStore;
    use crate::file_store::InMemoryFileStore;
    use crate::models::{ContactType, FileRecord, FileStatus, PhoneRecord};
    use crate::rate_gate::RateGate;
    use crate::result_store::InMemoryResultStore;
    use crate::upstream::fakes::FakeUpstreamClient;
    use crate::upstream::Capabilities;

    fn phones(n: usize) -> Vec<PhoneRecord> {
        (0..n)
            .map(|i| PhoneRecord {
                original: format!("phone-{i}"),
                e164: format!("+1555000{i:04}"),
            })
            .collect()
    }

    fn file(id: &str, total: i64) -> FileRecord {
        FileRecord {
            file_id: id.to_string(),
            file_name: format!("{id}.csv"),
            service: "blooio".to_string(),
            processing_total: total,
            processing_offset: 0,
            processing_status: FileStatus::Initialized,
            can_resume: true,
            last_error: None,
            results_url: None,
        }
    }

    async fn setup(
        total: usize,
        upstream_script: Vec<Result<Capabilities, crate::error::UpstreamError>>,
        max_wall_time: Duration,
    ) -> (
        ChunkWorker,
        Arc<InMemoryFileStore>,
        Arc<InMemoryChunkStore>,
        Arc<InMemoryResultStore>,
    ) {
        let file_store = Arc::new(InMemoryFileStore::new());
        let chunk_store = Arc::new(InMemoryChunkStore::new());
        let result_store = Arc::new(InMemoryResultStore::new());
        let cache_store = Arc::new(InMemoryCacheStore::new());
        let upstream = Arc::new(FakeUpstreamClient::new(upstream_script));

        file_store.insert(file("f1", total as i64)).await.unwrap();
        chunk_store
            .insert_pending("f1", 0, phones(total))
            .await
            .unwrap();

        let classifier = Classifier::new(cache_store, upstream, RateGate::new(10_000), 3, 6);
        let worker = ChunkWorker::new(
            file_store.clone(),
            chunk_store.clone(),
            result_store.clone(),
            classifier,
            3,
            max_wall_time,
        );
        (worker, file_store, chunk_store, result_store)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_completes_file_in_one_tick() {
        let (worker, file_store, _chunk_store, result_store) = setup(
            3,
            vec![Ok(Capabilities {
                imessage: true,
                sms: true,
            })],
            Duration::from_secs(280),
        )
        .await;

        let outcome = worker.process_queue_tick().await.unwrap();
        assert!(outcome.file_completed);
        assert_eq!(outcome.chunks_completed, 1);

        let file = file_store.get("f1").await.unwrap().unwrap();
        assert_eq!(file.processing_status, FileStatus::Completed);
        assert_eq!(file.processing_offset, 3);
        assert_eq!(result_store.count("f1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn idle_tick_when_nothing_runnable() {
        let file_store = Arc::new(InMemoryFileStore::new());
        let chunk_store = Arc::new(InMemoryChunkStore::new());
        let result_store = Arc::new(InMemoryResultStore::new());
        let cache_store = Arc::new(InMemoryCacheStore::new());
        let upstream = Arc::new(FakeUpstreamClient::new(vec![]));
        let classifier = Classifier::new(cache_store, upstream, RateGate::new(10_000), 3, 6);
        let worker = ChunkWorker::new(
            file_store,
            chunk_store,
            result_store,
            classifier,
            3,
            Duration::from_secs(280),
        );

        let outcome = worker.process_queue_tick().await.unwrap();
        assert_eq!(outcome.file_id, None);
        assert!(!outcome.file_completed);
    }

    #[tokio::test(start_paused = true)]
    async fn double_run_is_idempotent_once_completed() {
        let (worker, file_store, _chunk_store, result_store) = setup(
            2,
            vec![Ok(Capabilities {
                imessage: false,
                sms: true,
            })],
            Duration::from_secs(280),
        )
        .await;

        worker.process_queue_tick().await.unwrap();
        let outcome_two = worker.process_queue_tick().await.unwrap();

        assert_eq!(outcome_two.file_id, None, "completed file must not be re-acquired");
        assert_eq!(result_store.count("f1").await.unwrap(), 2);
        let file = file_store.get("f1").await.unwrap().unwrap();
        assert_eq!(file.processing_offset, 2);
        assert_eq!(result_store.list("f1").await.unwrap()[0].contact_type, ContactType::Android);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_mid_chunk_dedupes_on_reacquire() {
        let (worker, file_store, chunk_store, result_store) = setup(
            2,
            vec![Ok(Capabilities {
                imessage: true,
                sms: true,
            })],
            Duration::from_secs(280),
        )
        .await;

        // Simulate a crash: acquire the chunk (flips to processing) but never
        // finish the tick. A fresh worker invocation must reclaim it via
        // reset_stuck and not double-count already-durable results.
        chunk_store.acquire_next("f1", 3).await.unwrap();

        let outcome = worker.process_queue_tick().await.unwrap();
        assert!(outcome.file_completed);
        assert_eq!(result_store.count("f1").await.unwrap(), 2);

        let file = file_store.get("f1").await.unwrap().unwrap();
        assert_eq!(file.processing_offset, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_after_partial_result_write_does_not_reject_the_batch() {
        let (worker, file_store, chunk_store, result_store) = setup(
            3,
            vec![
                Ok(Capabilities {
                    imessage: true,
                    sms: true,
                }),
                Ok(Capabilities {
                    imessage: false,
                    sms: true,
                }),
            ],
            Duration::from_secs(280),
        )
        .await;

        // Simulate a crash after the first phone's Result made it to disk but
        // the chunk never reached `complete`: acquire the chunk (flips it to
        // processing) and write a durable row for its first phone by hand,
        // leaving the original, unsliced `chunk_data` on the row.
        let chunk = chunk_store.acquire_next("f1", 3).await.unwrap().unwrap();
        let first = &chunk.chunk_data[0];
        result_store
            .insert_batch(
                "f1",
                vec![ResultRow {
                    file_id: "f1".to_string(),
                    phone_number: first.original.clone(),
                    e164: first.e164.clone(),
                    is_ios: true,
                    supports_imessage: true,
                    supports_sms: true,
                    contact_type: ContactType::IPhone,
                    error: None,
                    from_cache: false,
                }],
            )
            .await
            .unwrap();

        // reset_stuck hands the worker back the same unsliced chunk_data, so
        // without the already-processed filter this would re-submit `first`
        // and the whole batch would be rejected by insert_batch's I4 check.
        let outcome = worker.process_queue_tick().await.unwrap();
        assert!(outcome.file_completed);
        assert_eq!(outcome.chunks_failed, 0);
        assert_eq!(result_store.count("f1").await.unwrap(), 3);

        let file = file_store.get("f1").await.unwrap().unwrap();
        assert_eq!(file.processing_offset, 3);
    }
}
