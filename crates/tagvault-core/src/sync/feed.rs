//! HTTP client for the remote tag repository.
//!
//! Three endpoints are used: `/session_key` (service key in, session cookie
//! out), `/metadata?since=N` and `/update?update_hash=ID`. The last two
//! return zlib-compressed JSON, which is inflated fully into memory.

use std::io::Read;
use std::time::Duration;

use flate2::read::ZlibDecoder;
use reqwest::blocking::{Client, Response};
use reqwest::header::COOKIE;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{VaultError, VaultResult};
use crate::models::RepoMeta;
use crate::sync::decoder;

/// Header carrying the pre-shared service key.
pub const SERVICE_KEY_HEADER: &str = "Hydrus-Key";

/// Name of the session cookie issued by `/session_key`.
pub const SESSION_COOKIE: &str = "session_key";

/// An authenticated session with the repository.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn cookie_header(&self) -> String {
        format!("{SESSION_COOKIE}={}", self.token)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("token", &"<redacted>").finish()
    }
}

/// Source of repository metadata and update blobs.
///
/// Implementations must be shareable across the fetch workers.
pub trait TagFeed: Send + Sync {
    fn get_session(&self) -> VaultResult<Session>;

    /// Updates published after the first `since` ones, in log order.
    fn get_repo_meta(&self, session: &Session, since: u64) -> VaultResult<RepoMeta>;

    /// Raw, decompressed bytes of one update blob.
    fn get_update(&self, session: &Session, blob_id: &str) -> VaultResult<Vec<u8>>;
}

/// [`TagFeed`] over HTTP with a pooled, keep-alive client.
pub struct FeedClient {
    client: Client,
    base_url: String,
    service_key: String,
}

impl FeedClient {
    /// Build the client from configuration. Certificate checks are relaxed
    /// here only, and only when `accept_invalid_certs` is set.
    pub fn new(config: &Config) -> VaultResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.repo_addr.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
        })
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    fn get_compressed(&self, session: &Session, url: String) -> VaultResult<Vec<u8>> {
        let response = self
            .client
            .get(&url)
            .header(COOKIE, session.cookie_header())
            .send()?;
        let body = check_status(response, &url)?.bytes()?;
        let inflated = inflate(&body)?;
        debug!(url = %url, compressed = body.len(), inflated = inflated.len(), "feed response");
        Ok(inflated)
    }
}

impl TagFeed for FeedClient {
    fn get_session(&self) -> VaultResult<Session> {
        let url = self.url("/session_key");
        let response = self
            .client
            .get(&url)
            .header(SERVICE_KEY_HEADER, &self.service_key)
            .send()?;
        let response = check_status(response, &url)?;
        let token = response
            .cookies()
            .find(|c| c.name() == SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or_else(|| VaultError::Auth(format!("no {SESSION_COOKIE} cookie from {url}")))?;
        info!(repo = %self.base_url, "feed session acquired");
        Ok(Session::new(token))
    }

    fn get_repo_meta(&self, session: &Session, since: u64) -> VaultResult<RepoMeta> {
        let raw = self.get_compressed(session, self.url(&format!("/metadata?since={since}")))?;
        decoder::decode_repo_meta(&raw)
    }

    fn get_update(&self, session: &Session, blob_id: &str) -> VaultResult<Vec<u8>> {
        self.get_compressed(session, self.url(&format!("/update?update_hash={blob_id}")))
    }
}

fn check_status(response: Response, url: &str) -> VaultResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(VaultError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

/// Inflate a complete zlib stream.
pub fn inflate(compressed: &[u8]) -> VaultResult<Vec<u8>> {
    let mut out = Vec::with_capacity(compressed.len() * 4);
    ZlibDecoder::new(compressed).read_to_end(&mut out)?;
    Ok(out)
}
