/// Lifecycle Supervisor
///
/// Owns every process-wide resource: the store pool, the chain client, the
/// metrics value and the shutdown token. Acquires the single-writer advisory
/// lock before the engine starts and keeps it renewed; loses it, and the
/// process stops writing. Shutdown runs ordered handlers, lowest priority
/// first: stop probes, drain the engine, release the lock, close the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::api;
use crate::config::AppConfig;
use crate::constants::SYNC_LOCK_NAME;
use crate::error::Error;
use crate::health::{self, ProbeContext};
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::rpc::RpcClient;
use crate::store::{BlockStore, PgStore};
use crate::sync::{EngineParams, EngineState, EngineStatus, SyncEngine};

/// How the process ended; main turns this into an exit code.
#[derive(Debug)]
pub enum RunOutcome {
    /// Clean shutdown on signal. Exit 0.
    Graceful,
    /// Another writer holds the lock. Exit 0 so orchestrators don't flap.
    LockContention,
    /// Fatal condition surfaced by the engine or the lock keeper. Exit 1.
    Fatal(Error),
}

pub async fn run(config: AppConfig) -> Result<RunOutcome, Error> {
    let metrics = Arc::new(
        Metrics::new().map_err(|e| Error::Config(format!("metrics registry: {e}")))?,
    );

    tracing::info!(
        database = %config.redacted_database_url(),
        endpoints = config.rpc_urls.len(),
        instance = %config.instance_id,
        "connecting store"
    );
    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    let client = Arc::new(RpcClient::new(
        config.rpc_urls.clone(),
        Duration::from_millis(config.rpc_timeout_ms),
    )?);
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_tokens,
        config.rate_limit_interval_ms,
        config.rate_limit_burst,
    )?);

    let status = Arc::new(RwLock::new(EngineStatus::default()));
    let shutdown = CancellationToken::new();

    // --- Single-writer gate ---
    if let Ok(mut s) = status.write() {
        s.state = EngineState::AcquireLock;
    }
    let lock_ttl = Duration::from_millis(config.lock_ttl_ms);
    let acquired = store
        .try_acquire_lock(SYNC_LOCK_NAME, &config.instance_id, lock_ttl)
        .await?;
    if !acquired {
        tracing::info!(
            lock = SYNC_LOCK_NAME,
            "another writer is live, exiting cleanly"
        );
        store.close().await;
        return Ok(RunOutcome::LockContention);
    }
    tracing::info!(lock = SYNC_LOCK_NAME, instance = %config.instance_id, "writer lock acquired");

    // --- Signal listener ---
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    // --- Lock keeper: renew at half TTL, stop the world if the lock slips ---
    let lock_lost = Arc::new(AtomicBool::new(false));
    let keeper_handle = {
        let store = Arc::clone(&store);
        let token = shutdown.clone();
        let lost = Arc::clone(&lock_lost);
        let instance_id = config.instance_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(lock_ttl / 2) => {}
                    _ = token.cancelled() => break,
                }
                match store.renew_lock(SYNC_LOCK_NAME, &instance_id, lock_ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!("writer lock lost, stopping");
                        lost.store(true, Ordering::SeqCst);
                        token.cancel();
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "lock renewal failed, will retry");
                    }
                }
            }
        })
    };

    // --- HTTP surfaces: probes and the read API ---
    let probe_ctx = Arc::new(ProbeContext {
        store: Arc::clone(&store),
        metrics: Arc::clone(&metrics),
        status: Arc::clone(&status),
        started_at: Instant::now(),
    });
    let health_handle = spawn_server(
        health::router(probe_ctx),
        config.health_check_port,
        "health",
        shutdown.clone(),
    )
    .await?;
    let api_ctx = api::ApiContext {
        store: Arc::clone(&store),
        status: Arc::clone(&status),
        metrics: Arc::clone(&metrics),
    };
    let api_handle = spawn_server(
        api::router(Arc::new(api_ctx)),
        config.api_port,
        "api",
        shutdown.clone(),
    )
    .await?;

    // --- The engine itself ---
    let params = EngineParams {
        start_block: config.start_block,
        batch_size: config.batch_size,
        concurrency: config.concurrency,
        confirmation_depth: config.confirmation_depth,
        poll_interval: Duration::from_millis(config.poll_interval_ms),
        max_retries: config.max_retries,
        token_contract: config.token_contract_address.clone(),
    };
    let mut engine = SyncEngine::new(
        params,
        Arc::clone(&client),
        Arc::clone(&store),
        limiter,
        Arc::clone(&metrics),
        Arc::clone(&status),
        shutdown.clone(),
    )?;
    let mut engine_handle = tokio::spawn(async move { engine.run().await });

    // Run until the engine stops on its own or a signal arrives.
    let early_result = tokio::select! {
        joined = &mut engine_handle => Some(flatten_join(joined)),
        _ = shutdown.cancelled() => None,
    };

    // --- Ordered shutdown, lowest priority first ---
    shutdown.cancel();

    // (1) stop accepting HTTP probes and API reads
    tracing::info!(priority = 1, "stopping http servers");
    let _ = health_handle.await;
    let _ = api_handle.await;

    // (2) wait up to the drain budget for the in-flight batch
    tracing::info!(priority = 2, "draining sync engine");
    let engine_result = match early_result {
        Some(result) => result,
        None => {
            let drain = Duration::from_millis(config.shutdown_drain_ms);
            match tokio::time::timeout(drain, &mut engine_handle).await {
                Ok(joined) => flatten_join(joined),
                Err(_) => {
                    tracing::warn!(
                        drain_ms = config.shutdown_drain_ms,
                        "engine did not drain in time, aborting in-flight batch"
                    );
                    engine_handle.abort();
                    Ok(())
                }
            }
        }
    };
    let _ = keeper_handle.await;

    // (3) release the advisory lock
    tracing::info!(priority = 3, "releasing writer lock");
    if let Err(e) = store
        .release_lock(SYNC_LOCK_NAME, &config.instance_id)
        .await
    {
        tracing::warn!(error = %e, "could not release writer lock; TTL will expire it");
    }

    // (4) drain and close the pool
    tracing::info!(priority = 4, "closing store pool");
    store.close().await;

    if lock_lost.load(Ordering::SeqCst) {
        return Ok(RunOutcome::Fatal(Error::Corruption(
            "single-writer lock was lost while syncing".into(),
        )));
    }
    match engine_result {
        Ok(()) => Ok(RunOutcome::Graceful),
        Err(e) => Ok(RunOutcome::Fatal(e)),
    }
}

fn flatten_join(joined: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        // A panic inside the engine is an uncaught error: fatal, exit 1.
        Err(e) => Err(Error::Corruption(format!("engine task failed: {e}"))),
    }
}

async fn spawn_server(
    router: axum::Router,
    port: u16,
    name: &'static str,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("{name} server cannot bind {addr}: {e}")))?;
    tracing::info!(%addr, server = name, "listening");

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(server = name, error = %e, "http server failed");
        }
    }))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
