use anyhow::Result;
use reading_processor::broker::BrokerConnection;
use reading_processor::config::Config;
use reading_processor::grpc::{serve_uds, ProcessorService};
use reading_processor::pipeline::{
    spawn_worker, BatchCommand, BatchSettings, PipelineHandle, PipelineStats,
};
use reading_processor::store::{build_pool, PgReadingStore};
use reading_processor::telemetry::{init_tracing, shutdown_tracing};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.otlp_endpoint.as_deref())?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = Arc::new(PgReadingStore::new(pool));
    if config.auto_migrate {
        store.ensure_schema().await?;
    }

    if usize::from(config.broker.prefetch) < config.batch_size {
        tracing::warn!(
            prefetch = config.broker.prefetch,
            batch_size = config.batch_size,
            "prefetch is below batch size; batches will only flush on the interval"
        );
    }

    let stats = Arc::new(PipelineStats::new());
    let (tx, rx) = mpsc::channel::<BatchCommand>(config.max_queue);
    let pipeline = PipelineHandle::new(tx, stats.clone());
    let worker_handle = spawn_worker(
        store.clone(),
        rx,
        stats.clone(),
        BatchSettings {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            max_inflight_flushes: config.max_inflight_flushes,
        },
    );

    let cancel = CancellationToken::new();
    let broker = Arc::new(BrokerConnection::connect(&config.broker).await?);
    let consumer = broker.consumer(stats.clone()).await?;
    let mut consumer_handle = {
        let handler = Arc::new(pipeline.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.start_consuming(handler, cancel).await })
    };

    let grpc_service = ProcessorService::new(pipeline.clone(), store.clone(), broker.clone());
    let mut grpc_handle = {
        let socket_path = config.grpc_socket_path.clone();
        let probe_interval = config.status_poll_interval();
        let cancel = cancel.clone();
        tokio::spawn(async move { serve_uds(&socket_path, grpc_service, probe_interval, cancel).await })
    };

    let mut consumer_done = false;
    let mut grpc_done = false;
    tokio::select! {
        res = &mut consumer_handle => {
            consumer_done = true;
            match res {
                Ok(Ok(())) => tracing::warn!("consumer stopped"),
                Ok(Err(err)) => tracing::error!(error = %format!("{err:#}"), "consumer failed"),
                Err(err) => tracing::error!(error=%err, "consumer task failed"),
            }
        }
        res = &mut grpc_handle => {
            grpc_done = true;
            match res {
                Ok(Ok(())) => tracing::warn!("control plane stopped"),
                Ok(Err(err)) => tracing::error!(error = %format!("{err:#}"), "control plane failed"),
                Err(err) => tracing::error!(error=%err, "gRPC task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    pipeline.shutdown().await?;
    if let Err(err) = worker_handle.await {
        tracing::error!(error=%err, "batch worker task failed");
    }
    if !consumer_done {
        match consumer_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %format!("{err:#}"), "consumer failed"),
            Err(err) => tracing::error!(error=%err, "consumer task failed"),
        }
    }
    if !grpc_done {
        let _ = grpc_handle.await;
    }
    if let Err(err) = broker.close().await {
        tracing::warn!(error = %format!("{err:#}"), "failed to close broker connection");
    }
    tracing::info!("reading processor stopped");
    shutdown_tracing();

    Ok(())
}
