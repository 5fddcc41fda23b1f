//! OCSP Stapling Cache Engine
//!
//! This crate implements the core of an OCSP stapling cache: a multi-keyed
//! in-memory index of pre-validated OCSP responses, a per-entry background
//! refresh state machine, and the fetch/verify glue between the two.
//!
//! # Overview
//!
//! Each monitored certificate becomes an [`Entry`] holding the DER bytes of
//! the most recent verified OCSP response for its `(issuer, serial)` pair.
//! Entries live in a [`Cache`] indexed both by name and by request
//! fingerprint, so an inbound OCSP request can be answered with a single
//! digest computation and two map probes. A background monitor task wakes on
//! a fixed tick and refreshes each entry according to its freshness window,
//! spreading refresh instants uniformly over the last quarter of the
//! response validity interval so that a fleet of daemons does not stampede
//! the upstream responders.
//!
//! Responses are verified against the issuer certificate before they are
//! ever served, and are optionally persisted to disk (atomic rename) so a
//! restart can come up warm without touching the network.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use staple_cache::{Cache, Entry, HttpFetcher, SystemClock, spawn_monitor};
//!
//! # async fn example(issuer: staple_cache::IssuerInfo) -> Result<(), staple_cache::CacheError> {
//! let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(10))?);
//! let clock = Arc::new(SystemClock);
//!
//! let mut entry = Entry::new(
//!     "example.org.pem",
//!     vec![0x01, 0x02],
//!     issuer,
//!     vec!["http://ocsp.example.net".to_string()],
//!     fetcher,
//!     clock,
//! );
//! entry.init().await?;
//!
//! let cache = Cache::new();
//! cache.insert(entry).await?;
//! spawn_monitor(cache.clone(), Duration::from_secs(60));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod fingerprint;
pub mod ocsp;

pub use cache::{Cache, spawn_monitor};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{CertDefinition, EntryDefaults, build_entry};
pub use entry::{Entry, ResponseSnapshot};
pub use error::CacheError;
pub use fetch::{FetchOutcome, Fetcher, HttpFetcher};
pub use fingerprint::HashAlgorithm;
pub use ocsp::{
    IssuerInfo, MalformedRequest, OcspErrorStatus, RequestInfo, parse_request, status_response,
};
