use crate::config::BrokerConfig;
use crate::pipeline::PipelineStats;
use crate::reading::{decode_reading, encode_reading, Reading};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;

/// Consumer-side callback for decoded messages. Returning an error requeues the delivery.
pub trait MessageHandler<T>: Send + Sync + 'static {
    fn handle(&self, message: T, cancel: CancellationToken) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

pub struct BrokerConnection {
    connection: Connection,
    config: BrokerConfig,
}

impl BrokerConnection {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .with_context(|| format!("connect to AMQP broker {}:{}", config.host, config.port))?;
        tracing::info!(host=%config.host, port = config.port, vhost=%config.vhost, "connected to AMQP broker");
        Ok(Self {
            connection,
            config: config.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn consumer(&self, stats: Arc<PipelineStats>) -> Result<QueueConsumer> {
        let channel = self
            .connection
            .create_channel()
            .await
            .context("open consumer channel")?;
        Ok(QueueConsumer {
            channel,
            queue: self.config.queue_name.clone(),
            prefetch: self.config.prefetch,
            consumer_tag: self.config.consumer_tag.clone(),
            stats,
        })
    }

    pub async fn publisher(&self, queue: &str) -> Result<QueuePublisher> {
        let channel = self
            .connection
            .create_channel()
            .await
            .context("open publisher channel")?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("enable publisher confirms")?;
        declare_queue(&channel, queue).await?;
        Ok(QueuePublisher {
            channel,
            queue: queue.to_string(),
        })
    }

    pub async fn close(&self) -> Result<()> {
        if self.is_connected() {
            self.connection
                .close(REPLY_SUCCESS, "shutdown")
                .await
                .context("close AMQP connection")?;
        }
        Ok(())
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("declare queue {queue}"))?;
    Ok(())
}

pub struct QueueConsumer {
    channel: Channel,
    queue: String,
    prefetch: u16,
    consumer_tag: String,
    stats: Arc<PipelineStats>,
}

impl QueueConsumer {
    /// Consumes until `cancel` fires or the broker ends the stream. Each delivery runs on
    /// its own task and is settled there; in-flight deliveries are awaited before returning.
    pub async fn start_consuming<H>(self, handler: Arc<H>, cancel: CancellationToken) -> Result<()>
    where
        H: MessageHandler<Reading>,
    {
        declare_queue(&self.channel, &self.queue).await?;
        self.channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .context("set consumer prefetch")?;
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("consume from {}", self.queue))?;
        self.stats.set_broker_connected(true);
        tracing::info!(queue=%self.queue, prefetch = self.prefetch, "consuming readings");

        let mut deliveries = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(queue=%self.queue, "consumer cancellation requested");
                    break;
                }
                Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error=%err, "delivery task failed");
                    }
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        let handler = handler.clone();
                        let cancel = cancel.clone();
                        let stats = self.stats.clone();
                        deliveries.spawn(async move {
                            let mut body = delivery.data;
                            let disposition = handle_delivery(&mut body, handler.as_ref(), cancel).await;
                            if let Disposition::Reject { .. } = disposition {
                                stats.record_rejected_delivery();
                            }
                            if let Err(err) = settle(&delivery.acker, disposition).await {
                                tracing::error!(error=%err, tag = delivery.delivery_tag, "failed to settle delivery");
                            }
                        });
                    }
                    Some(Err(err)) => {
                        self.stats.set_broker_connected(false);
                        self.stats.record_error(format!("consumer stream failed: {err}"));
                        tracing::error!(error=%err, queue=%self.queue, "consumer stream failed");
                        break;
                    }
                    None => {
                        self.stats.set_broker_connected(false);
                        tracing::warn!(queue=%self.queue, "consumer stream ended");
                        break;
                    }
                },
            }
        }

        if let Err(err) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            tracing::warn!(error=%err, "failed to cancel consumer");
        }
        let pending = deliveries.len();
        if pending > 0 {
            tracing::info!(count = pending, "waiting for in-flight deliveries to settle");
        }
        while let Some(joined) = deliveries.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error=%err, "delivery task failed");
            }
        }
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "consumer stopped").await {
            tracing::warn!(error=%err, "failed to close consumer channel");
        }
        self.stats.set_broker_connected(false);
        Ok(())
    }
}

/// Decodes a delivery body and runs the handler, deciding how the delivery is settled.
/// Undecodable bodies are dropped; handler failures go back to the queue.
pub async fn handle_delivery<H>(
    body: &mut [u8],
    handler: &H,
    cancel: CancellationToken,
) -> Disposition
where
    H: MessageHandler<Reading>,
{
    let reading = match decode_reading(body) {
        Ok(reading) => reading,
        Err(err) => {
            tracing::warn!(error=%err, bytes = body.len(), "discarding undecodable reading");
            return Disposition::Reject { requeue: false };
        }
    };
    let id = reading.id.clone();
    match handler.handle(reading, cancel).await {
        Ok(()) => Disposition::Ack,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), reading=%id, "reading handler failed; requeueing");
            Disposition::Reject { requeue: true }
        }
    }
}

async fn settle(acker: &Acker, disposition: Disposition) -> lapin::Result<()> {
    match disposition {
        Disposition::Ack => acker.ack(BasicAckOptions::default()).await,
        Disposition::Reject { requeue } => {
            acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue,
                })
                .await
        }
    }
}

pub struct QueuePublisher {
    channel: Channel,
    queue: String,
}

impl QueuePublisher {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn publish(&self, reading: &Reading) -> Result<()> {
        let body = encode_reading(reading).context("encode reading")?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_timestamp(Utc::now().timestamp() as u64);

        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .with_context(|| format!("publish reading {}", reading.id))?
            .await
            .with_context(|| format!("confirm reading {}", reading.id))?;
        if confirm.is_nack() {
            anyhow::bail!("broker rejected reading {}", reading.id);
        }
        tracing::debug!(reading=%reading.id, queue=%self.queue, "published reading");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "publisher done")
            .await
            .context("close publisher channel")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    impl MessageHandler<Reading> for RecordingHandler {
        async fn handle(&self, message: Reading, _cancel: CancellationToken) -> Result<()> {
            self.seen.lock().unwrap().push(message.id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingHandler {
        calls: AtomicUsize,
    }

    impl MessageHandler<Reading> for FailingHandler {
        async fn handle(&self, _message: Reading, _cancel: CancellationToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("batch write failed")
        }
    }

    fn body(json: &str) -> Vec<u8> {
        json.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn acks_after_handler_success() {
        let handler = RecordingHandler::default();
        let mut data = body(
            r#"{"id":"r-1","sensorId":"energy_Main_Hall","type":"energy","location":"Main Hall","timestamp":"2025-11-11T22:00:00Z","energyConsumption":100}"#,
        );

        let disposition = handle_delivery(&mut data, &handler, CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["r-1".to_string()]);
    }

    #[tokio::test]
    async fn malformed_body_is_dropped_without_calling_handler() {
        let handler = RecordingHandler::default();
        let mut data = body("{not json");

        let disposition = handle_delivery(&mut data, &handler, CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Reject { requeue: false });
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn valid_delivery_after_malformed_one_is_still_handled() {
        let handler = RecordingHandler::default();
        let mut garbage = body("\u{0}\u{1}not-json");
        let mut valid = body(
            r#"{"id":"r-3","sensorId":"air_quality_Lab","type":"air_quality","location":"Lab","timestamp":"2025-11-11T22:00:00Z","co2":410}"#,
        );

        let first = handle_delivery(&mut garbage, &handler, CancellationToken::new()).await;
        let second = handle_delivery(&mut valid, &handler, CancellationToken::new()).await;

        assert_eq!(first, Disposition::Reject { requeue: false });
        assert_eq!(second, Disposition::Ack);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["r-3".to_string()]);
    }

    #[tokio::test]
    async fn body_without_id_is_dropped() {
        let handler = RecordingHandler::default();
        let mut data = body(r#"{"sensorId":"motion_Lab","type":"motion","location":"Lab","timestamp":"2025-11-11T22:00:00Z"}"#);

        let disposition = handle_delivery(&mut data, &handler, CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Reject { requeue: false });
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_failure_requeues() {
        let handler = FailingHandler::default();
        let mut data = body(
            r#"{"id":"r-2","sensorId":"motion_Lab","type":"motion","location":"Lab","timestamp":"2025-11-11T22:00:00Z","motionDetected":true}"#,
        );

        let disposition = handle_delivery(&mut data, &handler, CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Reject { requeue: true });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
