use std::sync::Arc;

use chunked_classify_engine::cache_store::PostgresCacheStore;
use chunked_classify_engine::chunk_store::PostgresChunkStore;
use chunked_classify_engine::classifier::Classifier;
use chunked_classify_engine::config::{DbConfig, EngineConfig};
use chunked_classify_engine::file_store::PostgresFileStore;
use chunked_classify_engine::rate_gate::RateGate;
use chunked_classify_engine::result_store::PostgresResultStore;
use chunked_classify_engine::upstream::HttpUpstreamClient;
use chunked_classify_engine::worker::ChunkWorker;
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, RecyclingMethod, Runtime};
use dotenv::dotenv;
use log::{error, info};
use tokio_postgres_rustls::MakeRustlsConnect;

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    dotenv().ok();

    let once = std::env::args().any(|a| a == "--once");

    let engine_config = EngineConfig::from_env()?;
    let db_config = DbConfig::from_url(&EngineConfig::db_url()?)?;
    let pool = build_pool(&db_config)?;

    let cache_store = Arc::new(PostgresCacheStore::new(pool.clone()));
    let result_store = Arc::new(PostgresResultStore::new(pool.clone()));
    let chunk_store = Arc::new(PostgresChunkStore::new(pool.clone()));
    let file_store = Arc::new(PostgresFileStore::new(pool));

    let upstream = Arc::new(HttpUpstreamClient::new(
        engine_config.upstream_base_url.clone(),
        engine_config.upstream_api_key.clone(),
    ));
    let rate_gate = RateGate::new(engine_config.rate_limit_rps);
    let classifier = Classifier::new(
        cache_store,
        upstream,
        rate_gate,
        engine_config.max_retries,
        engine_config.cache_ttl_months,
    );

    let worker = ChunkWorker::new(
        file_store,
        chunk_store,
        result_store,
        classifier,
        engine_config.max_retries,
        engine_config.max_wall_time(),
    );

    if once {
        info!("running a single process-queue-tick");
        run_tick(&worker).await;
        return Ok(());
    }

    info!("starting resident worker loop, tick interval {:?}", TICK_INTERVAL);
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        ticker.tick().await;
        run_tick(&worker).await;
    }
}

async fn run_tick(worker: &ChunkWorker) {
    match worker.process_queue_tick().await {
        Ok(outcome) => {
            if let Some(file_id) = &outcome.file_id {
                info!(
                    "tick processed file {}: {} completed, {} split, {} failed, file_completed={}",
                    file_id,
                    outcome.chunks_completed,
                    outcome.chunks_split,
                    outcome.chunks_failed,
                    outcome.file_completed
                );
            }
        }
        Err(err) => error!("process-queue-tick failed: {}", err),
    }
}

fn build_pool(db: &DbConfig) -> Result<deadpool_postgres::Pool, Box<dyn std::error::Error>> {
    let mut pool_config = PoolConfig::new();
    pool_config.host = Some(db.host.clone());
    pool_config.port = Some(db.port);
    pool_config.dbname = Some(db.database.clone());
    pool_config.user = Some(db.username.clone());
    pool_config.password = Some(db.password.clone());
    pool_config.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let tls = MakeRustlsConnect::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth(),
    );

    let pool = pool_config.create_pool(Some(Runtime::Tokio1), tls)?;
    Ok(pool)
}
