//! Shared fixtures for the lifecycle tests: a mock Webex server and an
//! in-memory store wired into a `TokenManager`, plus a JSON log capture.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use webex_auth::{
    CredentialBundle, CredentialStore, DownstreamApi, MemoryBackend, OAuthRefresher,
    build_http_client,
};

use crate::manager::TokenManager;

pub(crate) const PROBE_PATH: &str = "/v1/people/me";
pub(crate) const OAUTH_PATH: &str = "/oauth/token";

/// Stored bundle with a fixed service identity.
pub(crate) fn bundle(downstream: Value, bridge: Value) -> Value {
    json!({
        "serviceIdentity": {
            "appId": "app-1",
            "clientId": "svc-client",
            "clientSecret": "svc-secret",
            "targetOrgId": "org-1"
        },
        "downstreamToken": downstream,
        "bridgeCredential": bridge
    })
}

pub(crate) struct Fixture {
    pub server: mockito::ServerGuard,
    pub backend: MemoryBackend,
    pub manager: TokenManager,
}

impl Fixture {
    pub async fn new(bundle: Value) -> Self {
        let contents = serde_json::to_vec(&bundle).unwrap();
        Self::with_backend(MemoryBackend::with_contents(&contents)).await
    }

    /// A fixture with its own mock server over an existing store.
    pub async fn with_backend(backend: MemoryBackend) -> Self {
        let server = mockito::Server::new_async().await;
        let client = build_http_client(Duration::from_secs(5)).unwrap();
        let manager = TokenManager::new(
            CredentialStore::new(backend.clone()),
            DownstreamApi::new(client.clone(), server.url(), PROBE_PATH),
            OAuthRefresher::new(client, format!("{}{}", server.url(), OAUTH_PATH)),
        );
        Self {
            server,
            backend,
            manager,
        }
    }

    /// Probe mock answering `status` for `token`.
    pub async fn probe(&mut self, token: &str, status: usize, hits: usize) -> mockito::Mock {
        self.server
            .mock("GET", PROBE_PATH)
            .match_header("authorization", format!("Bearer {token}").as_str())
            .with_status(status)
            .with_body("{}")
            .expect(hits)
            .create_async()
            .await
    }

    /// Bundle as currently persisted.
    pub fn persisted(&self) -> CredentialBundle {
        CredentialBundle::from_slice(&self.backend.contents().unwrap()).unwrap()
    }
}

/// Collects JSON log lines emitted while its guard is installed.
#[derive(Clone, Default)]
pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    /// Route this thread's events into the capture until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Structured fields of every captured event.
    pub fn fields(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .map(|event| event["fields"].clone())
            .collect()
    }

    /// `(tier, outcome)` of every event that carries a tier.
    pub fn tier_outcomes(&self) -> Vec<(String, String)> {
        self.fields()
            .into_iter()
            .filter_map(|fields| {
                let tier = fields["tier"].as_str()?.to_string();
                let outcome = fields["outcome"].as_str()?.to_string();
                Some((tier, outcome))
            })
            .collect()
    }
}
