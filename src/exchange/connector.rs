use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::Semaphore;

use super::types::{parse_klines, KlineRequest, KlineSource, TrafficStats};
use crate::config::ExchangeConfig;
use crate::errors::Error;
use crate::helpers::Result;
use crate::models::Candle;

const KLINES_PATH: &str = "/fapi/v1/klines";

struct Session {
    client: Client,
    created: Instant,
}

/// REST connector for the futures kline endpoint.
///
/// One pooled client is shared by every request. It is rebuilt once it is
/// older than `session_max_age` and whenever the collector reports a
/// transport failure. A semaphore caps in-flight requests globally while the
/// pool caps idle connections per host.
pub struct ExchangeConnector {
    config: ExchangeConfig,
    session: Mutex<Session>,
    permits: Semaphore,
    generation: AtomicU64,
    requests: AtomicU64,
    bytes: AtomicU64,
}

impl ExchangeConnector {
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        let client = Self::build_client(&config)?;
        let permits = Semaphore::new(config.max_connections.max(1));
        Ok(Self {
            config,
            session: Mutex::new(Session {
                client,
                created: Instant::now(),
            }),
            permits,
            generation: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        })
    }

    fn build_client(config: &ExchangeConfig) -> Result<Client> {
        let mut builder = Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.max_connections_per_host);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(builder.build()?)
    }

    /// Number of times the session has been replaced.
    pub fn session_generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn client(&self) -> Result<Client> {
        let mut session = self.session.lock();
        if session.created.elapsed() >= self.config.session_max_age() {
            debug!("HTTP session reached its maximum age, recreating it");
            session.client = Self::build_client(&self.config)?;
            session.created = Instant::now();
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        Ok(session.client.clone())
    }

    fn account(&self, bytes: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn reset_traffic(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl KlineSource for ExchangeConnector {
    async fn klines(&self, request: &KlineRequest) -> Result<Vec<Candle>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let client = self.client()?;
        let url = format!("{}{}", self.config.base_url, KLINES_PATH);

        let response = match client.get(&url).query(&request.query()).send().await {
            Ok(response) => response,
            Err(e) => {
                self.account(0);
                return Err(Error::from_reqwest(e));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                self.account(0);
                return Err(Error::from_reqwest(e));
            }
        };
        self.account(body.len());

        if !status.is_success() {
            debug!("[{} {}] Exchange answered {}: {}", request.symbol, request.interval, status, body);
            return Err(Error::Status(status.as_u16()));
        }
        parse_klines(&body)
    }

    async fn reset_session(&self) {
        match Self::build_client(&self.config) {
            Ok(client) => {
                let mut session = self.session.lock();
                session.client = client;
                session.created = Instant::now();
                self.generation.fetch_add(1, Ordering::Relaxed);
                info!("HTTP session rebuilt");
            }
            Err(e) => log::error!("Failed to rebuild HTTP session: {}", e),
        }
    }

    fn traffic(&self) -> TrafficStats {
        TrafficStats {
            requests: self.requests.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}
