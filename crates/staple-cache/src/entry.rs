//! Cached state for one monitored certificate
//!
//! An [`Entry`] owns everything needed to keep one `(issuer, serial)` pair
//! fresh: the pre-encoded OCSP request, the upstream responder list, the
//! current verified response with its validity timestamps, and the refresh
//! policy that decides when to go back upstream.
//!
//! # Refresh policy
//!
//! An entry refreshes immediately when it holds no response, when
//! `nextUpdate` has passed, or when the responder's `max-age` hint has
//! expired. Inside the update window, the last quarter of
//! `[thisUpdate, nextUpdate]`, each tick draws a uniformly random instant
//! in the window and refreshes once that instant has passed. Entries across
//! a fleet therefore pick different refresh moments instead of hammering
//! the upstream responder the second a window opens.
//!
//! # Locking
//!
//! All mutable fields sit behind one `RwLock`. Readers always observe a
//! coherent `(response, thisUpdate, nextUpdate)` tuple because updates are
//! published together under the write lock. Fetching and verification run
//! outside the lock; two concurrent refreshes may both fetch, but the
//! update phase serializes and the loser simply observes fresh state on its
//! next tick.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::CacheError;
use crate::fetch::{FetchOutcome, Fetcher};
use crate::fingerprint::{self, normalize_serial};
use crate::ocsp::{self, IssuerInfo, ResponseInfo};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Coherent view of a served response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    /// Raw DER of the OCSP response
    pub bytes: Vec<u8>,
    /// thisUpdate of the response
    pub this_update: SystemTime,
    /// nextUpdate of the response
    pub next_update: SystemTime,
}

#[derive(Debug, Default)]
pub(crate) struct EntryState {
    response: Vec<u8>,
    this_update: Option<SystemTime>,
    next_update: Option<SystemTime>,
    etag: Option<String>,
    max_age: Duration,
    last_sync: Option<SystemTime>,
}

/// Why a refresh fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshReason {
    NoResponse,
    Expired,
    MaxAgeElapsed,
    InWindow,
}

/// Freshness inputs for the refresh decision
pub(crate) struct FreshnessView {
    /// `(thisUpdate, nextUpdate)` when a response is held
    pub validity: Option<(SystemTime, SystemTime)>,
    pub max_age: Duration,
    pub last_sync: Option<SystemTime>,
}

/// Decide whether a refresh is due at `now`.
///
/// Pure function of the freshness view and the supplied RNG so the window
/// behavior can be tested with a seeded generator.
pub(crate) fn refresh_due<R: Rng>(
    view: &FreshnessView,
    now: SystemTime,
    rng: &mut R,
) -> Option<RefreshReason> {
    let Some((this_update, next_update)) = view.validity else {
        return Some(RefreshReason::NoResponse);
    };
    if next_update <= now {
        return Some(RefreshReason::Expired);
    }
    if !view.max_age.is_zero() {
        if let Some(last_sync) = view.last_sync {
            if last_sync + view.max_age <= now {
                return Some(RefreshReason::MaxAgeElapsed);
            }
        }
    }

    // update window is the last quarter of the validity interval
    let window = next_update.duration_since(this_update).unwrap_or_default() / 4;
    let window_start = next_update - window;
    if now < window_start {
        return None;
    }
    let window_secs = window.as_secs();
    if window_secs == 0 {
        return Some(RefreshReason::InWindow);
    }
    let instant = window_start + Duration::from_secs(rng.random_range(0..window_secs));
    if instant < now {
        Some(RefreshReason::InWindow)
    } else {
        None
    }
}

/// One monitored certificate's cached response and refresh machinery
pub struct Entry {
    name: String,
    serial: Vec<u8>,
    issuer: IssuerInfo,
    responders: Vec<String>,
    request: Vec<u8>,
    timeout: Duration,
    base_backoff: Duration,
    response_filename: Option<PathBuf>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    state: RwLock<EntryState>,
}

impl Entry {
    /// Create an entry for `(issuer, serial)` served by `responders`.
    ///
    /// The entry is not usable until [`Entry::init`] has run.
    pub fn new(
        name: impl Into<String>,
        serial: Vec<u8>,
        issuer: IssuerInfo,
        responders: Vec<String>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            serial: normalize_serial(&serial),
            issuer,
            responders,
            request: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            base_backoff: Duration::ZERO,
            response_filename: None,
            fetcher,
            clock,
            state: RwLock::new(EntryState::default()),
        }
    }

    /// Set the per-fetch deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the backoff slept before the single fetch retry
    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    /// Persist responses to `filename` and load them back on startup
    pub fn with_response_filename(mut self, filename: PathBuf) -> Self {
        self.response_filename = Some(filename);
        self
    }

    /// Use a pre-encoded OCSP request instead of encoding one during init
    pub fn with_request(mut self, request: Vec<u8>) -> Self {
        self.request = request;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Cache fingerprints of this entry under every supported algorithm
    pub fn digests(&self) -> Result<Vec<[u8; 32]>, CacheError> {
        fingerprint::entry_digests(
            self.issuer.subject_der(),
            self.issuer.key_bits(),
            &self.serial,
        )
    }

    /// Prepare the entry for serving: encode the outbound request, normalize
    /// responder URLs, and load a response, preferring the on-disk snapshot
    /// over a synchronous first fetch.
    ///
    /// A snapshot that exists but fails to parse or verify is an error; a
    /// missing snapshot is not. When nothing was loaded from disk the first
    /// refresh must succeed or init fails.
    pub async fn init(&mut self) -> Result<(), CacheError> {
        if self.responders.is_empty() {
            return Err(CacheError::Config(format!(
                "entry '{}' has no upstream responders",
                self.name
            )));
        }
        for responder in &mut self.responders {
            if let Some(stripped) = responder.strip_suffix('/') {
                *responder = stripped.to_string();
            }
        }
        if self.request.is_empty() {
            self.request = ocsp::encode_request(&self.issuer, &self.serial)?;
        }
        if self.read_from_disk().await? {
            return Ok(());
        }
        self.refresh_response().await
    }

    /// Current response, or nothing when the entry has never loaded one
    pub async fn snapshot(&self) -> Option<ResponseSnapshot> {
        let state = self.state.read().await;
        if state.response.is_empty() {
            return None;
        }
        let (this_update, next_update) = state.this_update.zip(state.next_update)?;
        Some(ResponseSnapshot {
            bytes: state.response.clone(),
            this_update,
            next_update,
        })
    }

    /// Fetch, verify, and install a fresh response if one is due.
    ///
    /// Returns `Ok(())` without touching the network when the entry is
    /// still fresh. A fetched body that is byte-identical to the current
    /// response (or a 304) only advances `eTag`, `max-age`, and `lastSync`.
    /// Verification failures leave the current response in place.
    pub async fn refresh_response(&self) -> Result<(), CacheError> {
        let now = self.clock.now();
        let Some(reason) = self.time_to_update(now).await else {
            return Ok(());
        };
        match reason {
            RefreshReason::NoResponse => info!(entry = %self.name, "no response, updating immediately"),
            RefreshReason::Expired => info!(entry = %self.name, "stale response, updating immediately"),
            RefreshReason::MaxAgeElapsed => info!(entry = %self.name, "max-age has expired, updating immediately"),
            RefreshReason::InWindow => info!(entry = %self.name, "time to update"),
        }

        let etag = self.state.read().await.etag.clone();
        let outcome = self.fetch_with_retry(etag.as_deref()).await?;

        let Some(bytes) = outcome.body else {
            info!(entry = %self.name, "response not modified since last sync");
            self.update_metadata(outcome.etag, outcome.max_age).await;
            return Ok(());
        };
        let unchanged = {
            let state = self.state.read().await;
            !state.response.is_empty() && state.response == bytes
        };
        if unchanged {
            info!(entry = %self.name, "response hasn't changed since last sync");
            self.update_metadata(outcome.etag, outcome.max_age).await;
            return Ok(());
        }

        let info = ocsp::verify_response(&self.issuer, &self.serial, &bytes, self.clock.now())?;
        self.install(bytes, info, outcome.etag, outcome.max_age, true)
            .await;
        info!(entry = %self.name, "response has been refreshed");
        Ok(())
    }

    /// Refresh wrapper for the monitor, which cannot handle the error itself
    pub async fn refresh_and_log(&self) {
        if let Err(err) = self.refresh_response().await {
            error!(entry = %self.name, error = %err, "failed to refresh response");
        }
    }

    async fn time_to_update(&self, now: SystemTime) -> Option<RefreshReason> {
        let view = {
            let state = self.state.read().await;
            let validity = if state.response.is_empty() {
                None
            } else {
                state.this_update.zip(state.next_update)
            };
            FreshnessView {
                validity,
                max_age: state.max_age,
                last_sync: state.last_sync,
            }
        };
        refresh_due(&view, now, &mut rand::rng())
    }

    async fn fetch_with_retry(&self, etag: Option<&str>) -> Result<FetchOutcome, CacheError> {
        let responder = self.pick_responder();
        info!(entry = %self.name, responder = %responder, "fetching response");
        match self.fetch_once(&responder, etag).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if !self.base_backoff.is_zero() => {
                warn!(entry = %self.name, error = %err, "fetch failed, backing off before retry");
                tokio::time::sleep(self.base_backoff).await;
                let responder = self.pick_responder();
                debug!(entry = %self.name, responder = %responder, "retrying fetch");
                self.fetch_once(&responder, etag).await
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_once(&self, responder: &str, etag: Option<&str>) -> Result<FetchOutcome, CacheError> {
        match tokio::time::timeout(self.timeout, self.fetcher.fetch(responder, &self.request, etag))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CacheError::Fetch(format!(
                "{responder} did not answer within {:?}",
                self.timeout
            ))),
        }
    }

    fn pick_responder(&self) -> String {
        let mut rng = rand::rng();
        let index = rng.random_range(0..self.responders.len());
        self.responders[index].clone()
    }

    async fn update_metadata(&self, etag: Option<String>, max_age: Duration) {
        let mut state = self.state.write().await;
        state.etag = etag;
        state.max_age = max_age;
        state.last_sync = Some(self.clock.now());
    }

    async fn install(
        &self,
        bytes: Vec<u8>,
        info: ResponseInfo,
        etag: Option<String>,
        max_age: Duration,
        persist: bool,
    ) {
        let mut state = self.state.write().await;
        state.etag = etag;
        state.max_age = max_age;
        state.last_sync = Some(self.clock.now());
        state.response = bytes;
        state.this_update = Some(info.this_update);
        state.next_update = Some(info.next_update);
        if persist {
            if let Some(filename) = &self.response_filename {
                match write_atomically(filename, &state.response) {
                    Ok(()) => {
                        info!(entry = %self.name, file = %filename.display(), "written new response to disk")
                    }
                    Err(err) => {
                        warn!(entry = %self.name, error = %err, "failed to persist response, keeping in-memory copy")
                    }
                }
            }
        }
    }

    async fn read_from_disk(&self) -> Result<bool, CacheError> {
        let Some(filename) = &self.response_filename else {
            return Ok(false);
        };
        let bytes = match std::fs::read(filename) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(CacheError::Disk(err)),
        };
        info!(entry = %self.name, file = %filename.display(), "read response from disk");
        let info = ocsp::verify_response(&self.issuer, &self.serial, &bytes, self.clock.now())?;
        self.install(bytes, info, None, Duration::ZERO, false).await;
        Ok(true)
    }

    /// Exclusive hold on the entry state for index surgery
    pub(crate) async fn write_guard(&self) -> tokio::sync::RwLockWriteGuard<'_, EntryState> {
        self.state.write().await
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("serial", &hex::encode(&self.serial))
            .field("responders", &self.responders)
            .finish_non_exhaustive()
    }
}

/// Write through a `.tmp` sibling and rename so a crash never leaves a
/// torn snapshot behind.
fn write_atomically(filename: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = filename.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, filename)
}
