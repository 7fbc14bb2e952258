use anyhow::{bail, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown STORE_BACKEND '{}'", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub log_level: String,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub db_max_connections: u32,
    pub dispatch_radius_km: f64,
    pub lock_wait_ms: u64,
    pub store_read_retries: u32,
    pub connection_queue_capacity: usize,
    pub ws_ping_interval_secs: u64,
    pub kafka_bootstrap_servers: Option<String>,
    pub kafka_push_topic: String,
    pub kafka_sasl_mechanism: String,
    pub kafka_username: String,
    pub kafka_password: String,
    pub kafka_security_protocol: String,
    pub kafka_max_retries: u32,
    pub kafka_circuit_breaker_cooldown: u64,
}

/// Reads `key`, falling back to `default` when unset or unparsable.
fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let store_backend = env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .parse()?;

        let db_host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let db_port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
        let db_name = env::var("DB_DATABASE").unwrap_or_else(|_| "moveit".to_string());
        let db_user = env::var("DB_USER").unwrap_or_else(|_| "moveit".to_string());
        let db_pwd = env::var("DB_PWD").unwrap_or_else(|_| "moveit".to_string());

        let database_url = format!(
            "postgres://{}:{}@{}:{}/{}",
            db_user, db_pwd, db_host, db_port, db_name
        );

        let kafka_bootstrap_servers = env::var("KAFKA_BOOTSTRAP_SERVERS")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let kafka_push_topic =
            env::var("KAFKA_PUSH_TOPIC").unwrap_or_else(|_| "moveit-push".to_string());
        let kafka_sasl_mechanism =
            env::var("KAFKA_SASL_MECHANISM").unwrap_or_else(|_| "SCRAM-SHA-256".to_string());
        let kafka_username = env::var("KAFKA_USERNAME").unwrap_or_default();
        let kafka_password = env::var("KAFKA_PASSWORD").unwrap_or_default();
        let kafka_security_protocol =
            env::var("KAFKA_SECURITY_PROTOCOL").unwrap_or_else(|_| "SASL_PLAINTEXT".to_string());

        Ok(Self {
            bind_addr,
            log_level,
            store_backend,
            database_url,
            db_max_connections: parsed("DB_MAX_CONNECTIONS", 50),
            dispatch_radius_km: parsed("DISPATCH_RADIUS_KM", 10.0),
            lock_wait_ms: parsed("LOCK_WAIT_MS", 2000),
            store_read_retries: parsed("STORE_READ_RETRIES", 3),
            connection_queue_capacity: parsed("CONNECTION_QUEUE_CAPACITY", 256),
            ws_ping_interval_secs: parsed("WS_PING_INTERVAL_SECS", 30).max(1),
            kafka_bootstrap_servers,
            kafka_push_topic,
            kafka_sasl_mechanism,
            kafka_username,
            kafka_password,
            kafka_security_protocol,
            kafka_max_retries: parsed("KAFKA_MAX_RETRIES", 5),
            kafka_circuit_breaker_cooldown: parsed("KAFKA_CIRCUIT_BREAKER_COOLDOWN", 300),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        assert_eq!("Memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!(" postgres ".parse::<StoreBackend>().unwrap(), StoreBackend::Postgres);
        assert!("sqlite".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_unparsable_numbers_fall_back_to_default() {
        env::set_var("MOVEIT_TEST_RADIUS", "ten");
        assert_eq!(parsed("MOVEIT_TEST_RADIUS", 10.0), 10.0);
        env::set_var("MOVEIT_TEST_RADIUS", " 2.5 ");
        assert_eq!(parsed("MOVEIT_TEST_RADIUS", 10.0), 2.5);
        assert_eq!(parsed("MOVEIT_TEST_UNSET_KEY", 7u32), 7);
    }
}
