//! OCSP stapling cache daemon
//!
//! `staplerd` keeps a set of pre-validated OCSP responses warm for a fleet
//! of TLS terminators. At startup every configured certificate becomes a
//! cache entry, loaded from its on-disk snapshot when one is available and
//! fetched synchronously otherwise; a background monitor then keeps each
//! entry fresh. Terminators query the daemon with standard OCSP-over-HTTP
//! and receive responses that were verified against the issuer before they
//! were ever cached, so the terminators themselves need no verification
//! logic and no responder connectivity.

pub mod config;
pub mod responder;

pub use config::{Config, ConfigError};
pub use responder::{router, ResponderState, OCSP_RESPONSE_CONTENT_TYPE};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use staple_cache::{
    build_entry, spawn_monitor, Cache, CacheError, CertDefinition, Clock, Fetcher, HttpFetcher,
    SystemClock,
};
use tracing::info;

/// Errors fatal to daemon startup or the serving loop
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("entry '{name}' failed to initialize: {source}")]
    EntryInit {
        name: String,
        #[source]
        source: CacheError,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("HTTP server died: {0}")]
    Serve(std::io::Error),
}

/// The assembled daemon: a populated cache plus the responder listener
pub struct Stapler {
    cache: Arc<Cache>,
    clock: Arc<dyn Clock>,
    http_addr: SocketAddr,
    monitor_tick: Duration,
    dont_die_on_stale_response: bool,
}

impl Stapler {
    /// Build the daemon from configuration, initializing every entry.
    ///
    /// Any entry that cannot produce a verified response, from disk or from
    /// one synchronous fetch, aborts startup so the operator hears about it
    /// immediately.
    pub async fn from_config(config: Config) -> Result<Self, ServerError> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Like [`Stapler::from_config`] with an injected clock
    pub async fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self, ServerError> {
        let http_addr = config.socket_addr()?;
        let defaults = config.entry_defaults();
        let shared: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(defaults.timeout)?);

        let cache = Cache::new();
        for def in &config.certificates {
            let mut entry = build_entry(def, &defaults, Arc::clone(&shared), Arc::clone(&clock))
                .await
                .map_err(|source| ServerError::EntryInit {
                    name: definition_label(def),
                    source,
                })?;
            if let Err(source) = entry.init().await {
                return Err(ServerError::EntryInit {
                    name: entry.name().to_string(),
                    source,
                });
            }
            cache.insert(entry).await?;
        }
        info!(entries = cache.entry_count().await, "cache initialized");

        Ok(Self {
            cache,
            clock,
            http_addr,
            monitor_tick: config.monitor_tick(),
            dont_die_on_stale_response: config.dont_die_on_stale_response,
        })
    }

    /// Handle to the cache, for adding or removing entries at runtime
    pub fn cache(&self) -> Arc<Cache> {
        Arc::clone(&self.cache)
    }

    /// Start the monitor and serve OCSP-over-HTTP until the listener dies
    pub async fn run(self) -> Result<(), ServerError> {
        spawn_monitor(Arc::clone(&self.cache), self.monitor_tick);

        let state = ResponderState {
            cache: self.cache,
            clock: self.clock,
            dont_die_on_stale_response: self.dont_die_on_stale_response,
        };
        let app = router(state);

        info!(addr = %self.http_addr, "starting OCSP responder");
        let listener = tokio::net::TcpListener::bind(self.http_addr)
            .await
            .map_err(ServerError::Serve)?;
        axum::serve(listener, app).await.map_err(ServerError::Serve)?;
        Ok(())
    }
}

fn definition_label(def: &CertDefinition) -> String {
    def.certificate
        .clone()
        .or_else(|| def.name.clone())
        .unwrap_or_else(|| "<unnamed>".to_string())
}
