use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::transport::{
    Delivery, FrameTransport, DEAD_LETTER_REASON_HEADER, RETRY_COUNT_HEADER,
};
use crate::config;
use crate::error::HivewatchError;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

struct Pending {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
}

/// Kafka-backed transport. Offsets are committed manually: a commit is the
/// acknowledgement. Requeue and dead-letter republish and then commit.
pub struct KafkaTransport {
    settings: config::Broker,
    dead_letter_topic: String,
    consumer: Option<Arc<StreamConsumer>>,
    producer: Option<FutureProducer>,
    pending: HashMap<u64, Pending>,
    next_tag: u64,
}

impl KafkaTransport {
    pub fn new(settings: config::Broker, dead_letter_topic: String) -> Self {
        Self {
            settings,
            dead_letter_topic,
            consumer: None,
            producer: None,
            pending: HashMap::new(),
            next_tag: 0,
        }
    }

    pub fn from_config(config: &config::Config) -> Self {
        Self::new(config.broker.clone(), config.dead_letter_topic())
    }

    fn consumer(&self) -> Result<Arc<StreamConsumer>, HivewatchError> {
        self.consumer
            .clone()
            .ok_or_else(|| HivewatchError::TransientIo("kafka consumer is not connected".into()))
    }

    fn producer(&self) -> Result<&FutureProducer, HivewatchError> {
        self.producer
            .as_ref()
            .ok_or_else(|| HivewatchError::TransientIo("kafka producer is not connected".into()))
    }

    fn take_pending(&mut self, tag: u64) -> Result<Pending, HivewatchError> {
        self.pending.remove(&tag).ok_or_else(|| {
            HivewatchError::Other(format!("delivery {} is not pending on this transport", tag))
        })
    }

    async fn commit(&self, pending: &Pending) -> Result<(), HivewatchError> {
        let consumer = self.consumer()?;
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &pending.topic,
            pending.partition,
            Offset::Offset(pending.offset + 1),
        )?;

        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|err| HivewatchError::Other(format!("offset commit task failed: {}", err)))??;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        pending: &Pending,
        delivery: &Delivery,
        extra: &[(&str, String)],
    ) -> Result<(), HivewatchError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in delivery
            .headers
            .iter()
            .filter(|(key, _)| !extra.iter().any(|(name, _)| *name == key.as_str()))
        {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }
        for (key, value) in extra {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }

        let mut record = FutureRecord::to(topic)
            .payload(&delivery.payload)
            .headers(headers);
        if let Some(key) = &pending.key {
            record = record.key(key);
        }

        self.producer()?
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(err, _)| err)?;
        Ok(())
    }

    /// Put a settled message back in `pending` so a failed settle can be retried.
    fn restore(&mut self, tag: u64, pending: Pending) {
        self.pending.insert(tag, pending);
    }
}

#[async_trait]
impl FrameTransport for KafkaTransport {
    async fn connect(&mut self) -> Result<(), HivewatchError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set(
                "session.timeout.ms",
                self.settings.session_timeout_ms.to_string(),
            )
            .create()?;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("message.timeout.ms", SEND_TIMEOUT.as_millis().to_string())
            .create()?;

        let consumer = Arc::new(consumer);
        let metadata = consumer.clone();
        let topic = self.settings.topic.clone();
        tokio::task::spawn_blocking(move || {
            metadata.fetch_metadata(Some(&topic), Duration::from_secs(5))
        })
        .await
        .map_err(|err| HivewatchError::Other(format!("metadata task failed: {}", err)))??;

        consumer.subscribe(&[self.settings.topic.as_str()])?;
        info!(
            target: "consumer",
            brokers = %self.settings.brokers,
            topic = %self.settings.topic,
            group_id = %self.settings.group_id,
            "Subscribed to frame topic"
        );

        self.pending.clear();
        self.consumer = Some(consumer);
        self.producer = Some(producer);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Delivery>, HivewatchError> {
        let consumer = self.consumer()?;
        let poll = Duration::from_millis(self.settings.poll_timeout_ms);

        let message = match tokio::time::timeout(poll, consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(result) => result?,
        };

        let mut headers = BTreeMap::new();
        if let Some(borrowed) = message.headers() {
            for header in borrowed.iter() {
                if let Some(value) = header.value {
                    headers.insert(
                        header.key.to_string(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
        }

        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            tag,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            attempts: Delivery::attempts_from_headers(&headers),
            headers,
        };
        self.pending.insert(
            tag,
            Pending {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
            },
        );
        debug!(
            target: "consumer",
            tag,
            partition = message.partition(),
            offset = message.offset(),
            attempts = delivery.attempts,
            "Received message"
        );
        Ok(Some(delivery))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), HivewatchError> {
        let pending = self.take_pending(delivery.tag)?;
        if let Err(err) = self.commit(&pending).await {
            self.restore(delivery.tag, pending);
            return Err(err);
        }
        Ok(())
    }

    async fn requeue(&mut self, delivery: &Delivery) -> Result<(), HivewatchError> {
        let pending = self.take_pending(delivery.tag)?;
        let retry = [(RETRY_COUNT_HEADER, (delivery.attempts + 1).to_string())];
        let topic = pending.topic.clone();

        let result = match self.publish(&topic, &pending, delivery, &retry).await {
            Ok(()) => self.commit(&pending).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.restore(delivery.tag, pending);
        }
        result
    }

    async fn dead_letter(
        &mut self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<(), HivewatchError> {
        let pending = self.take_pending(delivery.tag)?;
        let extra = [
            (DEAD_LETTER_REASON_HEADER, reason.to_string()),
            (RETRY_COUNT_HEADER, delivery.attempts.to_string()),
        ];
        let topic = self.dead_letter_topic.clone();

        let result = match self.publish(&topic, &pending, delivery, &extra).await {
            Ok(()) => self.commit(&pending).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.restore(delivery.tag, pending);
        }
        result
    }

    async fn disconnect(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        if let Some(producer) = self.producer.take() {
            let flushed =
                tokio::task::spawn_blocking(move || producer.flush(Duration::from_secs(5))).await;
            match flushed {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "consumer", "Producer flush failed: {}", err),
                Err(err) => warn!(target: "consumer", "Producer flush task failed: {}", err),
            }
        }
        self.pending.clear();
        info!(target: "consumer", "Disconnected from broker");
    }
}
