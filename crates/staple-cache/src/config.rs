//! Building entries from configuration definitions
//!
//! A [`CertDefinition`] names either a certificate file to monitor or a
//! bare `(name, serial)` pair, plus optional overrides for the upstream
//! responder list and HTTP proxy. Global defaults win unless the matching
//! `override_global_*` flag is set on the definition.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::clock::Clock;
use crate::entry::Entry;
use crate::error::CacheError;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::ocsp::{self, IssuerInfo};

/// One monitored certificate as it appears in the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertDefinition {
    /// Path to the certificate to monitor (PEM or DER)
    #[serde(default)]
    pub certificate: Option<String>,

    /// Entry name, used together with `serial` instead of a certificate file
    #[serde(default)]
    pub name: Option<String>,

    /// Certificate serial number in hex, paired with `name`
    #[serde(default)]
    pub serial: Option<String>,

    /// Path to the issuer certificate; may be omitted when the monitored
    /// certificate carries caIssuers AIA information
    #[serde(default)]
    pub issuer: Option<String>,

    /// Upstream OCSP responder URLs for this entry
    #[serde(default)]
    pub responders: Vec<String>,

    /// HTTP proxy URI for this entry
    #[serde(default)]
    pub proxy: Option<String>,

    /// Prefer this entry's responders over the global list
    #[serde(default)]
    pub override_global_upstream: bool,

    /// Prefer this entry's proxy over the global one
    #[serde(default)]
    pub override_global_proxy: bool,
}

/// Global knobs applied to every entry unless overridden
#[derive(Debug, Clone)]
pub struct EntryDefaults {
    /// Default upstream responder URLs
    pub responders: Vec<String>,
    /// Default HTTP proxy URI
    pub proxy: Option<String>,
    /// Folder for on-disk response snapshots; no folder, no persistence
    pub cache_folder: Option<PathBuf>,
    /// Per-fetch deadline
    pub timeout: Duration,
    /// Backoff before the single fetch retry
    pub base_backoff: Duration,
}

impl Default for EntryDefaults {
    fn default() -> Self {
        Self {
            responders: Vec::new(),
            proxy: None,
            cache_folder: None,
            timeout: Duration::from_secs(10),
            base_backoff: Duration::ZERO,
        }
    }
}

/// Assemble an entry from its definition and the global defaults.
///
/// The entry still needs [`Entry::init`] before it can serve.
pub async fn build_entry(
    def: &CertDefinition,
    defaults: &EntryDefaults,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
) -> Result<Entry, CacheError> {
    let mut issuer = match &def.issuer {
        Some(path) => Some(IssuerInfo::from_bytes(&read_file(path)?)?),
        None => None,
    };

    let (name, serial, cert_responders) = if let Some(path) = &def.certificate {
        let info = ocsp::parse_certificate_info(&read_file(path)?)?;
        if issuer.is_none() {
            issuer = fetch_issuer(&info.issuer_urls).await;
        }
        (path.clone(), info.serial, info.ocsp_responders)
    } else if let (Some(name), Some(serial)) = (&def.name, &def.serial) {
        let serial = hex::decode(serial).map_err(|e| {
            CacheError::Config(format!("failed to decode serial '{serial}': {e}"))
        })?;
        (name.clone(), serial, Vec::new())
    } else {
        return Err(CacheError::Config(
            "either certificate or name and serial must be provided".to_string(),
        ));
    };

    let issuer = issuer.ok_or_else(|| {
        CacheError::Config(
            "either issuer or a certificate containing issuer AIA information must be provided"
                .to_string(),
        )
    })?;

    let responders = resolve_responders(def, defaults, cert_responders);
    let fetcher = match resolve_proxy(def, defaults) {
        Some(proxy) => Arc::new(HttpFetcher::with_proxy(defaults.timeout, &proxy)?) as Arc<dyn Fetcher>,
        None => fetcher,
    };

    let mut entry = Entry::new(name.clone(), serial, issuer, responders, fetcher, clock)
        .with_timeout(defaults.timeout)
        .with_base_backoff(defaults.base_backoff);
    if let Some(folder) = &defaults.cache_folder {
        entry = entry.with_response_filename(response_filename(folder, &name));
    }
    Ok(entry)
}

fn read_file(path: &str) -> Result<Vec<u8>, CacheError> {
    std::fs::read(path)
        .map_err(|e| CacheError::Config(format!("failed to read '{path}': {e}")))
}

/// Globals win unless the definition opts out; the certificate's own AIA
/// responders are the fallback when neither is set.
fn resolve_responders(
    def: &CertDefinition,
    defaults: &EntryDefaults,
    from_certificate: Vec<String>,
) -> Vec<String> {
    if !defaults.responders.is_empty() && !def.override_global_upstream {
        defaults.responders.clone()
    } else if !def.responders.is_empty() {
        def.responders.clone()
    } else {
        from_certificate
    }
}

fn resolve_proxy(def: &CertDefinition, defaults: &EntryDefaults) -> Option<String> {
    if defaults.proxy.is_some() && !def.override_global_proxy {
        defaults.proxy.clone()
    } else {
        def.proxy.clone()
    }
}

/// Snapshot path for an entry: the file stem of its name inside the cache
/// folder, with a `.resp` extension
fn response_filename(folder: &Path, name: &str) -> PathBuf {
    let mut file = Path::new(name)
        .file_stem()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from(name));
    file.push(".resp");
    folder.join(file)
}

/// Download the issuer certificate from the monitored certificate's
/// caIssuers URLs, first parseable body wins.
async fn fetch_issuer(urls: &[String]) -> Option<IssuerInfo> {
    for url in urls {
        let response = match reqwest::get(url).await {
            Ok(response) => response,
            Err(err) => {
                error!(url = %url, error = %err, "failed to retrieve issuer");
                continue;
            }
        };
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                error!(url = %url, error = %err, "failed to read issuer body");
                continue;
            }
        };
        match IssuerInfo::from_bytes(&body) {
            Ok(issuer) => {
                info!(url = %url, "downloaded issuer certificate");
                return Some(issuer);
            }
            Err(err) => {
                error!(url = %url, error = %err, "failed to parse issuer body");
            }
        }
    }
    None
}
