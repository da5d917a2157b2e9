use crate::broker::BrokerConnection;
use crate::pipeline::{PipelineHandle, PipelineStats};
use crate::store::ReadingStore;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::{health_reporter, HealthReporter};

pub mod proto {
    tonic::include_proto!("readings.processor");
}

use proto::processor_server::{Processor, ProcessorServer};
use proto::{HealthRequest, HealthResponse};

pub struct ProcessorService<S> {
    pipeline: PipelineHandle,
    store: Arc<S>,
    broker: Arc<BrokerConnection>,
}

impl<S> Clone for ProcessorService<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            store: self.store.clone(),
            broker: self.broker.clone(),
        }
    }
}

impl<S: ReadingStore> ProcessorService<S> {
    pub fn new(pipeline: PipelineHandle, store: Arc<S>, broker: Arc<BrokerConnection>) -> Self {
        Self {
            pipeline,
            store,
            broker,
        }
    }

    fn broker_connected(&self) -> bool {
        self.broker.is_connected()
            && self
                .pipeline
                .stats()
                .broker_connected
                .load(Ordering::Relaxed)
    }

    async fn health(&self) -> HealthResponse {
        let store_connected = self.store.is_connected().await;
        to_health(&self.pipeline.stats(), self.broker_connected(), store_connected)
    }
}

fn to_health(stats: &PipelineStats, broker_connected: bool, store_connected: bool) -> HealthResponse {
    HealthResponse {
        queue_depth: stats.queue_depth.load(Ordering::Relaxed),
        buffered: stats.buffered.load(Ordering::Relaxed),
        last_flush_unix_ms: stats.last_flush_unix_ms.load(Ordering::Relaxed),
        last_batch_len: stats.last_batch_len.load(Ordering::Relaxed),
        average_flush_ms: stats.average_flush_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        inflight_flushes: stats.inflight_flushes.load(Ordering::Relaxed),
        flushed_readings_total: stats.flushed_readings_total.load(Ordering::Relaxed),
        failed_batches_total: stats.failed_batches_total.load(Ordering::Relaxed),
        rejected_deliveries_total: stats.rejected_deliveries_total.load(Ordering::Relaxed),
        broker_connected,
        store_connected,
        last_error: stats.last_error().unwrap_or_default(),
        build: env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[tonic::async_trait]
impl<S: ReadingStore> Processor for ProcessorService<S> {
    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(self.health().await))
    }

    async fn flush(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        self.pipeline
            .flush()
            .await
            .map_err(|err| Status::unavailable(format!("flush failed: {err}")))?;
        Ok(Response::new(self.health().await))
    }
}

/// Serves the control plane on a unix socket until `cancel` fires. The standard health
/// service reports SERVING only while both the broker and the store answer.
pub async fn serve_uds<S: ReadingStore>(
    socket_path: &str,
    service: ProcessorService<S>,
    probe_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)
        .with_context(|| format!("bind control socket {socket_path}"))?;
    let (health_reporter, health_service) = health_reporter();
    let probe = tokio::spawn(run_health_probe(
        health_reporter,
        service.clone(),
        probe_interval,
        cancel.clone(),
    ));

    let incoming = UnixListenerStream::new(uds);
    tracing::info!(socket = socket_path, "control plane listening");

    Server::builder()
        .add_service(health_service)
        .add_service(ProcessorServer::new(service))
        .serve_with_incoming_shutdown(incoming, cancel.cancelled())
        .await?;

    probe.abort();
    tokio::fs::remove_file(socket_path).await.ok();
    Ok(())
}

async fn run_health_probe<S: ReadingStore>(
    mut reporter: HealthReporter,
    service: ProcessorService<S>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut last = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let broker_connected = service.broker_connected();
        let store_connected = service.store.is_connected().await;
        let serving = broker_connected && store_connected;
        if serving {
            reporter
                .set_serving::<ProcessorServer<ProcessorService<S>>>()
                .await;
        } else {
            reporter
                .set_not_serving::<ProcessorServer<ProcessorService<S>>>()
                .await;
        }
        if last != Some(serving) {
            if serving {
                tracing::info!("processor healthy");
            } else {
                tracing::warn!(broker_connected, store_connected, "processor unhealthy");
            }
            last = Some(serving);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reflects_pipeline_counters() {
        let stats = PipelineStats::new();
        stats.queue_depth.store(3, Ordering::Relaxed);
        stats.buffered.store(7, Ordering::Relaxed);
        stats.average_flush_micros.store(2500, Ordering::Relaxed);
        stats.failed_batches_total.store(1, Ordering::Relaxed);
        stats.record_error("batch write failed: timeout");

        let health = to_health(&stats, true, false);

        assert_eq!(health.queue_depth, 3);
        assert_eq!(health.buffered, 7);
        assert_eq!(health.average_flush_ms, 2.5);
        assert_eq!(health.failed_batches_total, 1);
        assert!(health.broker_connected);
        assert!(!health.store_connected);
        assert_eq!(health.last_error, "batch write failed: timeout");
        assert_eq!(health.build, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn health_without_error_reports_empty_string() {
        let health = to_health(&PipelineStats::new(), false, true);
        assert!(health.last_error.is_empty());
        assert!(!health.broker_connected);
    }
}
