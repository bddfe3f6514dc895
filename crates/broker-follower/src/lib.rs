#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Follower-side sync client: periodically pulls signing keys, revocation
//! deltas, and provider configuration from a leader over HTTP and mirrors
//! them into a local [`Broker`].
//!
//! The state-machine discipline (closed time thresholds, staleness-driven
//! downgrade) follows the codebase's existing run-status idiom; the HTTP
//! client uses `reqwest` with an explicit per-request timeout, matching the
//! timeout/cancellation idiom already used elsewhere in this codebase.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use broker_config::ProviderConfigStore;
use broker_core::Broker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const DEGRADED_AFTER: chrono::Duration = chrono::Duration::minutes(5);
const LIMITED_AFTER: chrono::Duration = chrono::Duration::hours(1);
const OFFLINE_AFTER: chrono::Duration = chrono::Duration::hours(24);

/// Failure modes of a follower sync attempt. Authentication failures,
/// body-parse failures, and timeouts are all reported uniformly as
/// [`FollowerError::SyncFailed`]; the detailed cause is carried in the
/// message and also recorded via [`FollowerClient::last_error`].
#[derive(Debug, Error)]
pub enum FollowerError {
    /// The sync request failed for any reason (network, auth, timeout, or a
    /// malformed response body).
    #[error("sync failed: {0}")]
    SyncFailed(String),
    /// Applying a synced key, revocation delta, or config snapshot failed.
    #[error(transparent)]
    Broker(#[from] broker_error::BrokerError),
}

/// The follower's connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerStatus {
    /// Not yet started.
    Starting,
    /// Attempting the first sync.
    InitialSync,
    /// Last sync succeeded.
    Connected,
    /// More than 5 minutes since the last successful sync.
    Degraded,
    /// More than 1 hour since the last successful sync.
    Limited,
    /// More than 24 hours since the last successful sync.
    Offline,
}

fn status_for_staleness(elapsed: chrono::Duration) -> Option<FollowerStatus> {
    if elapsed > OFFLINE_AFTER {
        Some(FollowerStatus::Offline)
    } else if elapsed > LIMITED_AFTER {
        Some(FollowerStatus::Limited)
    } else if elapsed > DEGRADED_AFTER {
        Some(FollowerStatus::Degraded)
    } else {
        None
    }
}

#[derive(Debug, Serialize)]
struct SyncRequest {
    follower_id: String,
    signing_key_version: u32,
    provider_configs_version: u64,
    revocation_list_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    known_root_tokens: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    signing_key: Option<String>,
    signing_key_version: u32,
    #[serde(default)]
    provider_configs: Option<ProviderConfigStore>,
    provider_configs_version: u64,
    revocation_list_delta: Vec<String>,
    revocation_list_version: u64,
    #[serde(default)]
    next_sync_seconds: Option<u64>,
    #[allow(dead_code)]
    leader_timestamp: DateTime<Utc>,
}

struct FollowerInner {
    status: FollowerStatus,
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Pulls leader state into a local [`Broker`] on a periodic timer.
pub struct FollowerClient {
    broker: Broker,
    http: reqwest::Client,
    leader_url: String,
    bearer_token: String,
    follower_id: String,
    sync_interval_seconds: AtomicU64,
    request_timeout: Duration,
    inner: Mutex<FollowerInner>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl FollowerClient {
    /// Build a follower client targeting `leader_url`, authenticating with
    /// `bearer_token`, identifying itself as `follower_id`.
    pub fn new(
        broker: Broker,
        leader_url: impl Into<String>,
        bearer_token: impl Into<String>,
        follower_id: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            http: reqwest::Client::new(),
            leader_url: leader_url.into(),
            bearer_token: bearer_token.into(),
            follower_id: follower_id.into(),
            sync_interval_seconds: AtomicU64::new(DEFAULT_SYNC_INTERVAL.as_secs()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inner: Mutex::new(FollowerInner {
                status: FollowerStatus::Starting,
                last_sync_at: None,
                last_error: None,
            }),
            stop: Mutex::new(None),
        }
    }

    /// Override the periodic sync interval (default 60 seconds).
    pub fn with_sync_interval(self, interval: Duration) -> Self {
        self.sync_interval_seconds.store(interval.as_secs().max(1), Ordering::SeqCst);
        self
    }

    /// The current periodic sync interval, possibly adjusted by the
    /// leader's most recent recommendation.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds.load(Ordering::SeqCst))
    }

    /// Override the per-request timeout (default 30 seconds).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The broker this client keeps in sync.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// The current connectivity state.
    pub fn status(&self) -> FollowerStatus {
        self.inner.lock().expect("follower lock poisoned").status
    }

    /// The timestamp of the last successful sync, if any.
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().expect("follower lock poisoned").last_sync_at
    }

    /// The cause of the most recent sync failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().expect("follower lock poisoned").last_error.clone()
    }

    /// At least one signing key is locally available, meaning credential
    /// issuance can still verify and sign tokens even while degraded.
    pub fn can_operate(&self) -> bool {
        self.broker.has_signing_key()
    }

    /// Transition to `Initial-Sync` and attempt one sync. On success the
    /// client is `Connected`. On failure, `Degraded` if a signing key is
    /// already available locally, otherwise the start itself fails.
    pub async fn start(&self) -> Result<(), FollowerError> {
        self.set_status(FollowerStatus::InitialSync);
        match self.sync().await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.can_operate() {
                    self.set_status(FollowerStatus::Degraded);
                    warn!(error = %err, "initial sync failed, operating in degraded mode");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Perform one sync: fetch leader state and apply it atomically (key
    /// import, then revocation delta, then config snapshot).
    pub async fn sync(&self) -> Result<(), FollowerError> {
        let request = SyncRequest {
            follower_id: self.follower_id.clone(),
            signing_key_version: self.broker.known_key_version(),
            provider_configs_version: self.broker.config_version()?,
            revocation_list_version: self.broker.revocation_version(),
            known_root_tokens: None,
        };

        match self.do_sync(&request).await {
            Ok(response) => {
                if let Some(secs) = response.next_sync_seconds {
                    self.sync_interval_seconds.store(secs.max(1), Ordering::SeqCst);
                }
                self.apply(response)?;
                let mut inner = self.inner.lock().expect("follower lock poisoned");
                inner.last_sync_at = Some(Utc::now());
                inner.last_error = None;
                inner.status = FollowerStatus::Connected;
                info!(follower_id = %self.follower_id, "sync succeeded");
                Ok(())
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn do_sync(&self, request: &SyncRequest) -> Result<SyncResponse, FollowerError> {
        let url = format!("{}/sync", self.leader_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.bearer_token)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| FollowerError::SyncFailed(e.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|e| FollowerError::SyncFailed(e.to_string()))?;

        response
            .json::<SyncResponse>()
            .await
            .map_err(|e| FollowerError::SyncFailed(e.to_string()))
    }

    fn apply(&self, response: SyncResponse) -> Result<(), FollowerError> {
        if let Some(key) = response.signing_key {
            self.broker.import_key(&key, response.signing_key_version)?;
        }
        self.broker
            .apply_revocation_delta(&response.revocation_list_delta, response.revocation_list_version)?;
        if let Some(configs) = response.provider_configs {
            self.broker.apply_config_snapshot(&configs, response.provider_configs_version)?;
        }
        Ok(())
    }

    fn record_failure(&self, err: &FollowerError) {
        let mut inner = self.inner.lock().expect("follower lock poisoned");
        inner.last_error = Some(err.to_string());
        let elapsed = match inner.last_sync_at {
            Some(last) => Utc::now() - last,
            None => OFFLINE_AFTER + chrono::Duration::seconds(1),
        };
        if let Some(status) = status_for_staleness(elapsed) {
            inner.status = status;
        }
    }

    fn set_status(&self, status: FollowerStatus) {
        self.inner.lock().expect("follower lock poisoned").status = status;
    }

    /// Spawn the periodic sync timer. The interval re-reads
    /// [`Self::sync_interval`] on every tick, so a leader's recommended
    /// `next_sync_seconds` takes effect on the following wait. Idempotent
    /// `stop` halts it.
    pub fn spawn(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = watch::channel(false);
        *self.stop.lock().expect("follower lock poisoned") = Some(tx);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.sync_interval()) => {
                        let _ = self.sync().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Halt the periodic timer. Safe to call more than once, and safe to
    /// call even if [`Self::spawn`] was never invoked.
    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().expect("follower lock poisoned").as_ref() {
            let _ = tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_mock_provider::MockProvider;
    use broker_provider::ProviderRegistry;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker(dir: &std::path::Path) -> Broker {
        let mut providers = ProviderRegistry::new();
        providers.register("mock", Arc::new(MockProvider::default()));
        Broker::open(dir, providers).unwrap()
    }

    #[tokio::test]
    async fn start_succeeds_and_imports_leader_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "signing_key": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [3u8; 32]),
                "signing_key_version": 1,
                "provider_configs_version": 0,
                "revocation_list_delta": [],
                "revocation_list_version": 0,
                "next_sync_seconds": 60,
                "leader_timestamp": Utc::now().to_rfc3339(),
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = FollowerClient::new(broker(dir.path()), server.uri(), "secret", "f1");
        client.start().await.unwrap();

        assert_eq!(client.status(), FollowerStatus::Connected);
        assert!(client.can_operate());
        assert!(client.last_sync_at().is_some());
    }

    #[tokio::test]
    async fn start_fails_without_any_local_key_when_leader_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let client = FollowerClient::new(broker(dir.path()), "http://127.0.0.1:1", "secret", "f1");
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, FollowerError::SyncFailed(_)));
    }

    #[tokio::test]
    async fn start_degrades_when_a_local_key_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let b = broker(dir.path());
        b.current_key_version().unwrap();
        let client = FollowerClient::new(b, server.uri(), "wrong-secret", "f1");
        client.start().await.unwrap();
        assert_eq!(client.status(), FollowerStatus::Degraded);
        assert!(client.last_error().is_some());
    }

    #[tokio::test]
    async fn revocation_delta_is_applied_from_sync_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "signing_key": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [5u8; 32]),
                "signing_key_version": 1,
                "provider_configs_version": 0,
                "revocation_list_delta": ["agent-a"],
                "revocation_list_version": 3,
                "next_sync_seconds": 60,
                "leader_timestamp": Utc::now().to_rfc3339(),
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = FollowerClient::new(broker(dir.path()), server.uri(), "secret", "f1");
        client.start().await.unwrap();

        let token = client
            .broker()
            .create_root("agent-a", |b| b.scope("mock:op:read").ttl_days(1))
            .unwrap();
        assert!(client.broker().is_revoked(&token).unwrap());
    }

    #[test]
    fn staleness_thresholds_are_closed() {
        assert_eq!(status_for_staleness(chrono::Duration::minutes(4)), None);
        assert_eq!(
            status_for_staleness(chrono::Duration::minutes(6)),
            Some(FollowerStatus::Degraded)
        );
        assert_eq!(
            status_for_staleness(chrono::Duration::hours(2)),
            Some(FollowerStatus::Limited)
        );
        assert_eq!(
            status_for_staleness(chrono::Duration::hours(25)),
            Some(FollowerStatus::Offline)
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_halts_the_timer() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(
            FollowerClient::new(broker(dir.path()), "http://127.0.0.1:1", "secret", "f1")
                .with_sync_interval(Duration::from_millis(20)),
        );
        let handle = client.clone().spawn();
        client.stop();
        client.stop();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
