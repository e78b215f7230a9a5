use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contact capability classification derived from an upstream verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactType {
    IPhone,
    Android,
    Unknown,
    Error,
}

/// Lifecycle status of a `File`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploading,
    Initialized,
    Processing,
    Completed,
    Failed,
}

/// Lifecycle status of a `Chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    FailedPermanent,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::FailedPermanent)
    }
}

/// A single phone to be classified, as it lives inside a chunk's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneRecord {
    pub original: String,
    pub e164: String,
}

/// The authoritative job descriptor (`uploaded_files`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub file_name: String,
    pub service: String,
    pub processing_total: i64,
    pub processing_offset: i64,
    pub processing_status: FileStatus,
    pub can_resume: bool,
    pub last_error: Option<String>,
    pub results_url: Option<String>,
}

impl FileRecord {
    pub fn processing_progress(&self) -> f64 {
        if self.processing_total == 0 {
            return 100.0;
        }
        let pct = (self.processing_offset as f64 / self.processing_total as f64) * 100.0;
        (pct * 100.0).round() / 100.0
    }
}

/// A unit of work (`processing_chunks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: i64,
    pub file_id: String,
    pub chunk_offset: i64,
    pub chunk_data: Vec<PhoneRecord>,
    pub chunk_status: ChunkStatus,
    pub retry_count: i32,
}

/// A durable classification outcome (`blooio_results`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub file_id: String,
    pub phone_number: String,
    pub e164: String,
    pub is_ios: bool,
    pub supports_imessage: bool,
    pub supports_sms: bool,
    pub contact_type: ContactType,
    pub error: Option<String>,
    pub from_cache: bool,
}

/// A cached classifier verdict, keyed by E.164 (`blooio_cache`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub e164: String,
    pub is_ios: bool,
    pub supports_imessage: bool,
    pub supports_sms: bool,
    pub contact_type: ContactType,
    pub last_checked: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl_months: i64) -> bool {
        let ttl = chrono::Duration::days(ttl_months * 30);
        now - self.last_checked < ttl
    }
}

/// The outcome of classifying a single phone, before it is written to the
/// Result Store.
#[derive(Debug, Clone)]
pub struct ClassifierVerdict {
    pub is_ios: bool,
    pub supports_imessage: bool,
    pub supports_sms: bool,
    pub contact_type: ContactType,
    pub error: Option<String>,
    pub from_cache: bool,
}

impl ClassifierVerdict {
    pub fn into_result_row(self, file_id: &str, record: &PhoneRecord) -> ResultRow {
        ResultRow {
            file_id: file_id.to_string(),
            phone_number: record.original.clone(),
            e164: record.e164.clone(),
            is_ios: self.is_ios,
            supports_imessage: self.supports_imessage,
            supports_sms: self.supports_sms,
            contact_type: self.contact_type,
            error: self.error,
            from_cache: self.from_cache,
        }
    }

    pub fn from_cache_entry(entry: &CacheEntry) -> Self {
        Self {
            is_ios: entry.is_ios,
            supports_imessage: entry.supports_imessage,
            supports_sms: entry.supports_sms,
            contact_type: entry.contact_type,
            error: None,
            from_cache: true,
        }
    }
}

/// Advisory completion-quality breakdown (§7).
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySummary {
    pub iphone_pct: f64,
    pub android_pct: f64,
    pub unknown_pct: f64,
    pub error_pct: f64,
}
