use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineResult;
use crate::models::CacheEntry;

/// Cross-file classifier verdict cache (§4.2), keyed by E.164. Freshness is
/// enforced on read (I6): a stale row is simply not returned, never deleted
/// eagerly.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns only the entries that are still fresh (`last_checked` within
    /// the TTL). Implementations must do this in a single round-trip.
    async fn lookup_batch(
        &self,
        phones: &[String],
        ttl_months: i64,
    ) -> EngineResult<HashMap<String, CacheEntry>>;

    /// Sets or refreshes the entry, stamping `last_checked = now`. Must never
    /// be called with an error verdict (enforced by the Classifier, not
    /// here).
    async fn upsert(&self, entry: CacheEntry) -> EngineResult<()>;

    /// Convenience single-phone lookup — a degenerate case of
    /// `lookup_batch`, per §4.2.
    async fn lookup(&self, phone: &str) -> EngineResult<Option<CacheEntry>> {
        let phones = vec![phone.to_string()];
        let mut map = self.lookup_batch(&phones, default_ttl_months()).await?;
        Ok(map.remove(phone))
    }

    /// Drops a cached verdict — used by `reprocess-single` (§4.7) ahead of a
    /// fresh classification.
    async fn invalidate(&self, phone: &str) -> EngineResult<()>;
}

/// The TTL used by the single-phone convenience lookup when a caller doesn't
/// have an `EngineConfig` handy (tests, `reprocess-single`). Production call
/// sites go through `lookup_batch` with the configured TTL.
fn default_ttl_months() -> i64 {
    6
}

pub struct PostgresCacheStore {
    pool: deadpool_postgres::Pool,
}

impl PostgresCacheStore {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PostgresCacheStore {
    async fn lookup_batch(
        &self,
        phones: &[String],
        ttl_months: i64,
    ) -> EngineResult<HashMap<String, CacheEntry>> {
        if phones.is_empty() {
            return Ok(HashMap::new());
        }

        let client = self.pool.get().await?;
        let cutoff = Utc::now() - chrono::Duration::days(ttl_months * 30);

        let rows = client
            .query(
                "SELECT e164, is_ios, supports_imessage, supports_sms, contact_type, last_checked
                 FROM blooio_cache
                 WHERE e164 = ANY($1) AND last_checked >= $2",
                &[&phones, &cutoff],
            )
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let contact_type_str: String = row.get("contact_type");
            let entry = CacheEntry {
                e164: row.get("e164"),
                is_ios: row.get("is_ios"),
                supports_imessage: row.get("supports_imessage"),
                supports_sms: row.get("supports_sms"),
                contact_type: parse_contact_type(&contact_type_str),
                last_checked: row.get("last_checked"),
            };
            out.insert(entry.e164.clone(), entry);
        }
        Ok(out)
    }

    async fn upsert(&self, entry: CacheEntry) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO blooio_cache (e164, is_ios, supports_imessage, supports_sms, contact_type, last_checked)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (e164) DO UPDATE SET
                    is_ios = EXCLUDED.is_ios,
                    supports_imessage = EXCLUDED.supports_imessage,
                    supports_sms = EXCLUDED.supports_sms,
                    contact_type = EXCLUDED.contact_type,
                    last_checked = EXCLUDED.last_checked",
                &[
                    &entry.e164,
                    &entry.is_ios,
                    &entry.supports_imessage,
                    &entry.supports_sms,
                    &contact_type_str(entry.contact_type),
                    &entry.last_checked,
                ],
            )
            .await?;
        Ok(())
    }

    async fn invalidate(&self, phone: &str) -> EngineResult<()> {
        let client = self.pool.get().await?;
        client
            .execute("DELETE FROM blooio_cache WHERE e164 = $1", &[&phone])
            .await?;
        Ok(())
    }
}

fn contact_type_str(ct: crate::models::ContactType) -> &'static str {
    use crate::models::ContactType::*;
    match ct {
        IPhone => "iPhone",
        Android => "Android",
        Unknown => "Unknown",
        Error => "ERROR",
    }
}

fn parse_contact_type(s: &str) -> crate::models::ContactType {
    use crate::models::ContactType::*;
    match s {
        "iPhone" => IPhone,
        "Android" => Android,
        "ERROR" => Error,
        _ => Unknown,
    }
}

/// In-memory fake used by tests (the Classifier's and Chunk Worker's logic
/// should be exercisable without a live Postgres instance).
pub struct InMemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn lookup_batch(
        &self,
        phones: &[String],
        ttl_months: i64,
    ) -> EngineResult<HashMap<String, CacheEntry>> {
        let entries = self.entries.lock().await;
        let now = Utc::now();
        let mut out = HashMap::new();
        for phone in phones {
            if let Some(entry) = entries.get(phone) {
                if entry.is_fresh(now, ttl_months) {
                    out.insert(phone.clone(), entry.clone());
                }
            }
        }
        Ok(out)
    }

    async fn upsert(&self, entry: CacheEntry) -> EngineResult<()> {
        self.entries.lock().await.insert(entry.e164.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, phone: &str) -> EngineResult<()> {
        self.entries.lock().await.remove(phone);
        Ok(())
    }
}
