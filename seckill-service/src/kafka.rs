use futures::future::join_all;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::{OrderRequest, ACTIVATE_SENTINEL};
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};
use crate::config::KafkaConfig;
use crate::error::LogError;

/// Producer side of the durable log.
pub trait LogProducer: Send + Sync + 'static {
    /// Appends every request of the batch. Not retried: on error the
    /// returned [`LogError::Undelivered`] names the requests that never made
    /// it so their reservations can be released.
    fn send_batch(&self, batch: &[OrderRequest]) -> impl Future<Output = Result<(), LogError>> + Send;
}

pub struct KafkaLog {
    producer: FutureProducer,
    topic: String,
    batch_timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl KafkaLog {
    pub fn new(config: &KafkaConfig) -> Result<Self, LogError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "1")
            .set("linger.ms", "5")
            .set("message.send.max.retries", "0")
            .set("message.timeout.ms", config.batch_timeout.as_millis().to_string())
            .create()?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            batch_timeout: config.batch_timeout,
            max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff,
        })
    }

    /// Single-record send, retried with a fixed pause between attempts.
    pub async fn send_with_retry(&self, payload: &str) -> Result<(), LogError> {
        retry_fixed(self.max_attempts, self.retry_backoff, || async move {
            let record = FutureRecord::<(), _>::to(&self.topic).payload(payload);
            self.producer
                .send(record, self.batch_timeout)
                .await
                .map(|_| ())
                .map_err(|(e, _)| e)
        })
        .await
    }

    /// Writes the control record that wakes the commit reader.
    pub async fn activate_reader(&self) -> Result<(), LogError> {
        self.send_with_retry(ACTIVATE_SENTINEL).await
    }
}

/// Calls `send` up to `max_attempts` times, sleeping `backoff` after each
/// failure except the last.
pub async fn retry_fixed<F, Fut>(max_attempts: u32, backoff: Duration, mut send: F) -> Result<(), LogError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), KafkaError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match send().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= max_attempts => {
                return Err(LogError::Exhausted { attempts: attempt, last: e });
            }
            Err(e) => {
                warn!("Send attempt {}/{} failed: {}", attempt, max_attempts, e);
                time::sleep(backoff).await;
            }
        }
    }
}

impl LogProducer for KafkaLog {
    async fn send_batch(&self, batch: &[OrderRequest]) -> Result<(), LogError> {
        if batch.is_empty() {
            return Ok(());
        }

        let records: Vec<(String, String)> = batch
            .iter()
            .map(|request| (request.item_id.to_string(), request.encode()))
            .collect();

        let deliveries = join_all(records.iter().map(|(key, payload)| {
            let record = FutureRecord::to(&self.topic).key(key).payload(payload);
            self.producer.send(record, self.batch_timeout)
        }))
        .await;

        let mut undelivered = Vec::new();
        let mut reason = String::new();
        for (request, delivery) in batch.iter().zip(deliveries) {
            if let Err((e, _)) = delivery {
                if reason.is_empty() {
                    reason = e.to_string();
                }
                undelivered.push(*request);
            }
        }

        if undelivered.is_empty() {
            Ok(())
        } else {
            Err(LogError::Undelivered {
                undelivered,
                total: batch.len(),
                reason,
            })
        }
    }
}

/// Creates the single-partition topic. A topic that already exists, or a
/// broker that refuses, is only logged.
pub async fn ensure_topic(config: &KafkaConfig) {
    let admin: AdminClient<DefaultClientContext> = match ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .create()
    {
        Ok(admin) => admin,
        Err(e) => {
            warn!("Could not create admin client: {}", e);
            return;
        }
    };

    let topic = NewTopic::new(&config.topic, 1, TopicReplication::Fixed(1));
    let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(5)));
    match admin.create_topics([&topic], &options).await {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(name) => info!("Created topic {}", name),
                    Err((name, code)) => warn!("Topic {} not created: {}", name, code),
                }
            }
        }
        Err(e) => warn!("Create topic request failed: {}", e),
    }
}

/// Consumer for the commit loop. Offsets are stored by the loop after each
/// record is handled and committed on the configured interval.
pub fn create_consumer(config: &KafkaConfig) -> Result<StreamConsumer, LogError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", &config.group_id)
        .set("bootstrap.servers", &config.brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.commit.interval.ms", config.commit_interval.as_millis().to_string())
        .set("fetch.min.bytes", config.fetch_min_bytes.to_string())
        .set("fetch.max.bytes", config.fetch_max_bytes.to_string())
        .set("fetch.wait.max.ms", config.fetch_wait.as_millis().to_string())
        .set("fetch.error.backoff.ms", config.fetch_backoff.as_millis().to_string())
        .create()?;

    consumer.subscribe(&[config.topic.as_str()])?;
    Ok(consumer)
}
