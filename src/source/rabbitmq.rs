//! RabbitMQ source.
//!
//! Consumes from the configured queue and treats a configurable idle
//! timeout as end-of-stream. The consumer task is the only writer to the
//! data channel: when the timeout path closes the receiver, the next send
//! fails and the task nack-requeues that delivery and stops, so no message
//! is lost and no close-flag locking is needed.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, Consumer};
use snafu::prelude::*;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::RabbitMqSourceConfig;
use crate::error::{AmqpConnectSnafu, AmqpConsumeSnafu, SourceError};
use crate::source::DataSource;
use crate::types::{Payload, ProgressWatch, Record};

const CONSUMER_TAG: &str = "mqpump";

pub struct RabbitMqSource {
    connection: Option<Connection>,
    rows: mpsc::Receiver<Payload>,
    errors: mpsc::Receiver<SourceError>,
    consume_timeout: Duration,
    watch: ProgressWatch,
}

impl RabbitMqSource {
    pub async fn open(cfg: &RabbitMqSourceConfig, plain_text: bool) -> Result<Self, SourceError> {
        let connection = Connection::connect(&cfg.client.url(), ConnectionProperties::default())
            .await
            .context(AmqpConnectSnafu)?;
        let channel = connection
            .create_channel()
            .await
            .context(AmqpConnectSnafu)?;
        channel
            .basic_qos(cfg.consumer.prefetch_count, BasicQosOptions::default())
            .await
            .context(AmqpConsumeSnafu)?;
        let consumer = channel
            .basic_consume(
                &cfg.consumer.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context(AmqpConsumeSnafu)?;

        let (row_tx, row_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        tokio::spawn(consume_loop(consumer, row_tx, err_tx, plain_text));

        Ok(Self {
            connection: Some(connection),
            rows: row_rx,
            errors: err_rx,
            consume_timeout: cfg.consume_timeout,
            watch: ProgressWatch::indeterminate(),
        })
    }
}

#[async_trait]
impl DataSource for RabbitMqSource {
    async fn next(&mut self) -> Result<Option<Payload>, SourceError> {
        tokio::select! {
            maybe = self.rows.recv() => match maybe {
                Some(payload) => {
                    self.watch.record_read();
                    Ok(Some(payload))
                }
                None => Ok(None),
            },
            Some(err) = self.errors.recv() => Err(err),
            _ = tokio::time::sleep(self.consume_timeout) => {
                info!("consume timeout");
                self.rows.close();
                // a send may have been buffered before the close
                match self.rows.try_recv() {
                    Ok(payload) => {
                        self.watch.record_read();
                        Ok(Some(payload))
                    }
                    Err(_) => Ok(None),
                }
            }
        }
    }

    fn watch(&self) -> ProgressWatch {
        self.watch.clone()
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.close(200, "bye").await {
                tracing::error!("failed to close consumer connection: {err}");
            }
        }
        Ok(())
    }
}

/// Feed consumed deliveries into the data channel until it closes.
async fn consume_loop(
    mut consumer: Consumer,
    rows: mpsc::Sender<Payload>,
    errors: mpsc::Sender<SourceError>,
    plain_text: bool,
) {
    let requeue = BasicNackOptions {
        requeue: true,
        ..Default::default()
    };

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                let _ = errors.try_send(SourceError::Consumer { source: err });
                continue;
            }
        };

        let request_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string());

        let data = if plain_text {
            Record::Raw(Bytes::from(delivery.data.clone()))
        } else {
            match serde_json::from_slice(&delivery.data) {
                Ok(value) => Record::Json(value),
                Err(err) => {
                    let _ = errors.try_send(SourceError::DeliveryDecode {
                        request_id: request_id.clone(),
                        source: err,
                    });
                    let _ = delivery.nack(requeue).await;
                    continue;
                }
            }
        };

        let payload = Payload {
            request_id: request_id.clone(),
            data,
        };
        if rows.send(payload).await.is_err() {
            // receiver closed by the consume timeout; put the message back
            let _ = delivery.nack(requeue).await;
            return;
        }

        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            let _ = errors.try_send(SourceError::AmqpAck { request_id, source: err });
        }
    }
}
