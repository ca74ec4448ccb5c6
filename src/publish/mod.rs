//! Rate-limited, retrying RabbitMQ publisher.
//!
//! Bodies are raw bytes in plain-text mode and JSON otherwise. Each
//! attempt takes one rate-limiter slot; failures retry with exponential
//! backoff until five seconds have elapsed, then surface annotated with
//! the routing key. Messages are published with persistent delivery mode.

pub mod limiter;

use std::time::Duration;

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use snafu::prelude::*;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::TargetConfig;
use crate::error::{ConnectSnafu, EncodeSnafu, PublishCancelledSnafu, PublishError};
use crate::types::Record;

use self::limiter::RateLimiter;

/// Total time publish attempts may take before the error surfaces.
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(5);
/// First retry delay; doubles per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Ceiling for a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(1);
/// AMQP persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Target a pipeline publishes records to.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, record: &Record) -> Result<(), PublishError>;
}

/// Publisher backed by a RabbitMQ channel.
pub struct RmqPublisher {
    connection: Mutex<Option<Connection>>,
    channel: Channel,
    exchange: String,
    routing_key: String,
    limiter: RateLimiter,
    log_bodies: bool,
    shutdown: CancellationToken,
}

impl RmqPublisher {
    pub async fn connect(
        cfg: &TargetConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, PublishError> {
        let connection = Connection::connect(&cfg.client.url(), ConnectionProperties::default())
            .await
            .context(ConnectSnafu)?;
        let channel = connection.create_channel().await.context(ConnectSnafu)?;

        Ok(Self {
            connection: Mutex::new(Some(connection)),
            channel,
            exchange: cfg.publisher.exchange.clone(),
            routing_key: cfg.publisher.routing_key.clone(),
            limiter: RateLimiter::new(cfg.rps),
            log_bodies: cfg.enable_message_logs,
            shutdown,
        })
    }

    async fn try_publish(&self, body: &[u8]) -> Result<(), lapin::Error> {
        let properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?;
        confirm.await?;
        Ok(())
    }

    /// Tear the AMQP client down. Safe to call more than once.
    pub async fn close(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.take() {
            if let Err(err) = connection.close(200, "bye").await {
                error!("failed to close publisher connection: {err}");
            }
        }
    }
}

#[async_trait]
impl Publish for RmqPublisher {
    async fn publish(&self, record: &Record) -> Result<(), PublishError> {
        let body = record.encode().context(EncodeSnafu)?;
        if self.log_bodies {
            debug!(body = %String::from_utf8_lossy(&body), "publishing message");
        }

        let started = Instant::now();
        let mut delay = INITIAL_BACKOFF;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return PublishCancelledSnafu.fail(),
                _ = self.limiter.acquire() => {}
            }

            let err = match self.try_publish(&body).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if started.elapsed() >= MAX_RETRY_ELAPSED {
                return Err(PublishError::Publish {
                    routing_key: self.routing_key.clone(),
                    source: err,
                });
            }
            warn!("publish attempt failed, retrying: {err}");

            tokio::select! {
                _ = self.shutdown.cancelled() => return PublishCancelledSnafu.fail(),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }
}
