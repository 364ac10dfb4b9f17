//! Kafka implementations of the broker boundary.
//!
//! The producer is always idempotent (`enable.idempotence=true`, `acks=all`,
//! at most 5 in-flight requests per connection) so librdkafka's own resends
//! never duplicate a record. The consumer never auto-commits; offsets move
//! only through [`RecordConsumer::commit`].

use super::{BrokerRecord, Delivery, OutgoingRecord, RecordConsumer, RecordProducer};
use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings for [`KafkaRecordProducer`].
#[derive(Debug, Clone)]
pub struct KafkaProducerConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    pub compression: String,
    pub linger_ms: u64,
    pub batch_size: usize,
    /// Upper bound for librdkafka's internal delivery attempts.
    pub message_timeout: Duration,
    pub metadata_timeout: Duration,
}

impl Default for KafkaProducerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "order-producer".to_string(),
            compression: "snappy".to_string(),
            linger_ms: 10,
            batch_size: 16384,
            message_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(10),
        }
    }
}

/// Idempotent Kafka producer.
#[derive(Clone)]
pub struct KafkaRecordProducer {
    producer: FutureProducer,
    message_timeout: Duration,
    metadata_timeout: Duration,
}

impl KafkaRecordProducer {
    pub fn new(config: &KafkaProducerConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            // Idempotency configuration (prevents duplicates on internal retry)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            // Throughput
            .set("compression.type", &config.compression)
            .set("linger.ms", config.linger_ms.to_string())
            .set("batch.size", config.batch_size.to_string())
            .create()
            .map_err(classify_error)?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            client_id = %config.client_id,
            compression = %config.compression,
            "Kafka producer created with idempotence enabled"
        );

        Ok(Self {
            producer,
            message_timeout: config.message_timeout,
            metadata_timeout: config.metadata_timeout,
        })
    }
}

#[async_trait]
impl RecordProducer for KafkaRecordProducer {
    async fn send(&self, record: &OutgoingRecord) -> Result<Delivery, BrokerError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let future_record = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(&record.payload)
            .headers(headers);

        match self
            .producer
            .send(future_record, Timeout::After(self.message_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((err, _)) => Err(classify_error(err)),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<usize, BrokerError> {
        let producer = self.producer.clone();
        let result = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::Transient(format!("flush task failed: {}", e)))?;

        let remaining = self.producer.in_flight_count().max(0) as usize;
        match result {
            Ok(()) => Ok(remaining),
            Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut)) => {
                warn!(remaining, "Flush timed out with records still in flight");
                Ok(remaining)
            }
            Err(e) => Err(classify_error(e)),
        }
    }

    async fn partition_count(&self, topic: &str) -> Result<usize, BrokerError> {
        // librdkafka performs metadata fetch synchronously
        let metadata = self
            .producer
            .client()
            .fetch_metadata(Some(topic), self.metadata_timeout)
            .map_err(classify_error)?;

        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| BrokerError::Permanent(format!("topic {} not in metadata", topic)))?;

        if let Some(err) = topic_metadata.error() {
            return Err(BrokerError::Permanent(format!(
                "topic {} metadata error: {:?}",
                topic,
                RDKafkaErrorCode::from(err)
            )));
        }
        Ok(topic_metadata.partitions().len())
    }
}

/// Settings for [`KafkaRecordConsumer`].
#[derive(Debug, Clone)]
pub struct KafkaConsumerConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub client_id: String,
    pub topic: String,
    pub auto_offset_reset: String,
    pub session_timeout: Duration,
}

/// Kafka consumer-group member with manual offset commits.
pub struct KafkaRecordConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
    /// Non-fatal error that cut the previous batch short, reported by the next poll.
    pending_error: Mutex<Option<BrokerError>>,
}

impl KafkaRecordConsumer {
    pub fn new(config: &KafkaConsumerConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false") // Commit only after the sink write
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set(
                "session.timeout.ms",
                config.session_timeout.as_millis().to_string(),
            )
            .set("enable.partition.eof", "false")
            .create()
            .map_err(classify_error)?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(classify_error)?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %config.group_id,
            topic = %config.topic,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
            pending_error: Mutex::new(None),
        })
    }
}

fn to_broker_record(msg: &BorrowedMessage<'_>) -> BrokerRecord {
    let headers = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    let value = h
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    (h.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    BrokerRecord {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(<[u8]>::to_vec),
        payload: msg.payload().map(<[u8]>::to_vec),
        headers,
        timestamp: msg.timestamp().to_millis(),
    }
}

#[async_trait]
impl RecordConsumer for KafkaRecordConsumer {
    async fn poll_batch(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        if let Some(err) = self.pending_error.lock().take() {
            return Err(err);
        }
        let mut batch = Vec::new();

        // Wait for the first record, then drain whatever is already buffered
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(batch),
            Ok(Err(e)) => return Err(classify_error(e)),
            Ok(Ok(msg)) => batch.push(to_broker_record(&msg)),
        }

        while batch.len() < max_records {
            match tokio::time::timeout(Duration::from_millis(10), self.consumer.recv()).await {
                Ok(Ok(msg)) => batch.push(to_broker_record(&msg)),
                Ok(Err(e)) => return cut_batch_short(batch, classify_error(e), &self.pending_error),
                Err(_) => break,
            }
        }

        debug!(records = batch.len(), "Polled batch from Kafka");
        Ok(batch)
    }

    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(classify_error)?;

        // Sync commits block until the coordinator answers
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Transient(format!("commit task failed: {}", e)))?
            .map_err(classify_error)
    }

    async fn halt_partition(&self, topic: &str, partition: i32) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(topic, partition);
        self.consumer.pause(&tpl).map_err(classify_error)
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "Kafka consumer left the group");
    }
}

/// Handle an error that arrives after part of a batch was already fetched.
///
/// A fatal error is returned at once and the partial batch is dropped
/// uncommitted. Anything else keeps the batch and is held for the next poll,
/// since the stream hands each error out only once.
fn cut_batch_short(
    batch: Vec<BrokerRecord>,
    err: BrokerError,
    pending: &Mutex<Option<BrokerError>>,
) -> Result<Vec<BrokerRecord>, BrokerError> {
    if err.is_fatal() {
        warn!(error = %err, dropped = batch.len(), "Fatal Kafka error while draining batch");
        return Err(err);
    }
    warn!(error = %err, records = batch.len(), "Kafka error while draining batch");
    *pending.lock() = Some(err);
    Ok(batch)
}

/// Map a librdkafka error onto the pipeline's retry classes.
pub fn classify_error(err: KafkaError) -> BrokerError {
    let message = err.to_string();
    match err.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => BrokerError::Fatal(message),
        Some(code) if is_transient_code(code) => BrokerError::Transient(message),
        Some(_) => BrokerError::Permanent(message),
        None => match err {
            KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) => {
                BrokerError::Fatal(message)
            }
            KafkaError::Canceled | KafkaError::NoMessageReceived => {
                BrokerError::Transient(message)
            }
            _ => BrokerError::Permanent(message),
        },
    }
}

fn is_transient_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::NotEnoughReplicas
            | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::RebalanceInProgress
    )
}

fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Fatal
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
    )
}
