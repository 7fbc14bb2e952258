use async_trait::async_trait;
use chrono::Utc;
use prost::Message as ProstMessage;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::push::{PushEvent, PushSender};
use crate::config::AppConfig;
use crate::models::UserId;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire format consumed by the downstream push workers.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PushEnvelope {
    #[prost(string, tag = "1")]
    pub target_user_id: String,
    #[prost(string, tag = "2")]
    pub kind: String,
    #[prost(string, tag = "3")]
    pub title: String,
    #[prost(string, tag = "4")]
    pub body: String,
    #[prost(string, optional, tag = "5")]
    pub ride_id: Option<String>,
    #[prost(int64, tag = "6")]
    pub sent_at_ms: i64,
}

impl PushEnvelope {
    fn new(target: UserId, event: &PushEvent) -> Self {
        Self {
            target_user_id: target.to_string(),
            kind: event.kind.to_string(),
            title: event.title.clone(),
            body: event.body.clone(),
            ride_id: event.ride_id.map(|id| id.to_string()),
            sent_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Stops publishing for `cooldown` after `max_failures` consecutive failures.
pub struct CircuitBreaker {
    max_failures: u32,
    cooldown: Duration,
    failures: AtomicU32,
    open_until: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            cooldown,
            failures: AtomicU32::new(0),
            open_until: Mutex::new(None),
        }
    }

    pub fn allow(&self) -> bool {
        let mut open_until = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
        match *open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                *open_until = None;
                self.failures.store(0, Ordering::SeqCst);
                info!("Circuit breaker reset. Resuming push publishing.");
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.max_failures {
            let mut open_until = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
            if open_until.is_none() {
                warn!(
                    "Circuit breaker tripped ({} consecutive failures)! Skipping pushes for {} seconds...",
                    failures,
                    self.cooldown.as_secs()
                );
                *open_until = Some(Instant::now() + self.cooldown);
            }
        }
    }
}

/// Publishes push events to Kafka with SASL authentication.
pub struct KafkaPush {
    producer: FutureProducer,
    topic: String,
    breaker: CircuitBreaker,
}

impl KafkaPush {
    pub fn new(config: &AppConfig, bootstrap_servers: &str) -> anyhow::Result<Self> {
        info!("Initializing Kafka producer for topic: {}", config.kafka_push_topic);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .set("security.protocol", &config.kafka_security_protocol);
        if config.kafka_security_protocol.starts_with("SASL") {
            client_config
                .set("sasl.mechanism", &config.kafka_sasl_mechanism)
                .set("sasl.username", &config.kafka_username)
                .set("sasl.password", &config.kafka_password);
        }

        let producer: FutureProducer = client_config.create()?;

        Ok(Self {
            producer,
            topic: config.kafka_push_topic.clone(),
            breaker: CircuitBreaker::new(
                config.kafka_max_retries,
                Duration::from_secs(config.kafka_circuit_breaker_cooldown),
            ),
        })
    }
}

#[async_trait]
impl PushSender for KafkaPush {
    async fn send(&self, target: UserId, event: &PushEvent) -> anyhow::Result<()> {
        if !self.breaker.allow() {
            anyhow::bail!("circuit breaker open, {} push skipped", event.kind);
        }

        let payload = PushEnvelope::new(target, event).encode_to_vec();
        let key = target.to_string();
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(record, Timeout::After(SEND_TIMEOUT)).await {
            Ok(_) => {
                self.breaker.record_success();
                Ok(())
            }
            Err((e, _)) => {
                self.breaker.record_failure();
                Err(e.into())
            }
        }
    }
}
