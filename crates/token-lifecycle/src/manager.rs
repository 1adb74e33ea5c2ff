//! Token manager
//!
//! Decides whether the current downstream token is usable and, when it is
//! not, walks the refresh cascade:
//!
//! 1. Downstream refresh-token grant
//! 2. Token issuance authorized by the bridge credential
//! 3. OAuth refresh of the bridge credential, then one more issuance
//! 4. Manual re-authorization required
//!
//! Each tier runs at most once per cascade. Every successful tier persists
//! its new credentials through the store before the next step, so a crash
//! mid-cascade never loses a rotated refresh token.
//!
//! An optional deadline is checked before each network step rather than by
//! cancelling work in flight: a step that has started, including the save
//! that follows it, always completes.

use std::time::{Duration, Instant};

use common::Secret;
use tracing::{debug, error, info, warn};
use webex_auth::{
    ActiveBridge, CredentialBundle, CredentialStore, DEFAULT_EXPIRY_MARGIN_SECS, DownstreamApi,
    EndpointError, OAuthBridge, OAuthRefresher, TokenResponse, expires_at, now_millis,
};

use crate::error::{Error, Result};
use crate::telemetry::{self, Tier};

/// What we currently believe about the session's access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Loaded from the store, not yet probed
    Unchecked,
    /// Probed successfully or freshly minted
    Valid,
    /// Rejected by the API, missing, or locally expired
    Invalid,
}

/// One invocation's view of the credential bundle.
///
/// Owned by a single caller; concurrent invocations each hold their own
/// session and reconcile through the store.
#[derive(Debug, Clone)]
pub struct Session {
    bundle: CredentialBundle,
    state: TokenState,
}

impl Session {
    pub fn new(bundle: CredentialBundle) -> Self {
        Self {
            bundle,
            state: TokenState::Unchecked,
        }
    }

    pub fn bundle(&self) -> &CredentialBundle {
        &self.bundle
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    /// Current downstream access token, if any.
    pub fn access_token(&self) -> Option<&Secret<String>> {
        self.bundle
            .downstream_token
            .access_token
            .as_ref()
            .filter(|token| !token.is_blank())
    }

    /// Recorded expiry of the downstream token (unix milliseconds).
    pub fn token_expiry(&self) -> Option<u64> {
        self.bundle.downstream_token.expires
    }

    /// Mark the token unusable, e.g. after a business call got a 401.
    pub fn invalidate(&mut self) {
        self.state = TokenState::Invalid;
    }

    pub fn into_bundle(self) -> CredentialBundle {
        self.bundle
    }
}

/// Keeps a downstream access token valid across invocations.
pub struct TokenManager {
    store: CredentialStore,
    api: DownstreamApi,
    oauth: OAuthRefresher,
    expiry_margin: Duration,
    deadline: Option<Instant>,
}

impl TokenManager {
    pub fn new(store: CredentialStore, api: DownstreamApi, oauth: OAuthRefresher) -> Self {
        Self {
            store,
            api,
            oauth,
            expiry_margin: Duration::from_secs(DEFAULT_EXPIRY_MARGIN_SECS),
            deadline: None,
        }
    }

    /// Treat tokens expiring within `margin` as already expired.
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Start no further network step once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// `TransientFailure` once the deadline has passed.
    pub(crate) fn check_deadline(&self, step: &'static str) -> Result<()> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(step, "invocation deadline reached, not starting further network calls");
            return Err(Error::TransientFailure(format!(
                "invocation deadline reached before {step}"
            )));
        }
        Ok(())
    }

    pub fn api(&self) -> &DownstreamApi {
        &self.api
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Load the bundle from the store and start an unchecked session.
    pub async fn start_session(&self) -> Result<Session> {
        let bundle = self.store.load().await?;
        debug!(
            store = self.store.kind(),
            has_refresh_token = bundle.downstream_token.refresh_token.is_some(),
            "credential bundle loaded"
        );
        Ok(Session::new(bundle))
    }

    /// Return a usable access token, probing and refreshing as needed.
    ///
    /// A token already known to be valid is returned without any network
    /// call. An unchecked token costs exactly one probe when it is accepted.
    pub async fn ensure_valid_token(&self, session: &mut Session) -> Result<Secret<String>> {
        if session.state == TokenState::Valid
            && let Some(token) = session.access_token()
        {
            return Ok(token.clone());
        }

        if session.state != TokenState::Invalid {
            self.check(session).await?;
        }
        if session.state == TokenState::Invalid {
            self.refresh(session).await?;
        }

        session.access_token().cloned().ok_or_else(|| {
            Error::AuthenticationFailed("no access token available after refresh".into())
        })
    }

    /// Run the cascade regardless of whether the current token still works.
    pub async fn force_refresh(&self, session: &mut Session) -> Result<()> {
        info!("forced refresh requested");
        self.refresh(session).await
    }

    /// Run the refresh cascade. On success the session holds a new token
    /// that has already been persisted.
    pub async fn refresh(&self, session: &mut Session) -> Result<()> {
        session.state = TokenState::Invalid;

        if !self.refresh_downstream(session).await? {
            self.issue_with_bridge(session).await?;
        }

        session.state = TokenState::Valid;
        Ok(())
    }

    async fn check(&self, session: &mut Session) -> Result<()> {
        let Some(token) = session.access_token().cloned() else {
            info!(probe = "skipped_missing", "no downstream access token stored");
            telemetry::record_probe("skipped_missing");
            session.state = TokenState::Invalid;
            return Ok(());
        };

        let margin = self.expiry_margin.as_millis() as u64;
        if session.bundle.downstream_token.is_expired(now_millis(), margin) {
            info!(
                probe = "skipped_expired",
                expires = session.token_expiry(),
                "downstream token expired locally, skipping probe"
            );
            telemetry::record_probe("skipped_expired");
            session.state = TokenState::Invalid;
            return Ok(());
        }

        self.check_deadline("token probe")?;
        match self.api.probe(&token).await {
            Ok(()) => {
                debug!(probe = "valid", "downstream token accepted");
                telemetry::record_probe("valid");
                session.state = TokenState::Valid;
                Ok(())
            }
            Err(e) if e.is_auth() => {
                info!(probe = "invalid", error = %e, "downstream token rejected");
                telemetry::record_probe("invalid");
                session.state = TokenState::Invalid;
                Ok(())
            }
            Err(e) => {
                warn!(probe = "transient", error = %e, "token probe failed");
                telemetry::record_probe("transient");
                Err(Error::TransientFailure(format!("token probe failed: {e}")))
            }
        }
    }

    /// Tier 1. `Ok(false)` means fall through to the bridge.
    async fn refresh_downstream(&self, session: &mut Session) -> Result<bool> {
        let tier = Tier::DownstreamRefresh;
        let Some(refresh_token) = session.bundle.downstream_token.refresh_token.clone() else {
            info!(%tier, outcome = "skipped", "no downstream refresh token stored");
            telemetry::record_tier(tier, "skipped");
            return Ok(false);
        };

        self.check_deadline("downstream refresh")?;
        match self
            .api
            .refresh(&session.bundle.service_identity, &refresh_token)
            .await
        {
            Ok(response) => {
                self.accept_downstream(session, response).await?;
                info!(
                    %tier,
                    outcome = "success",
                    expires = session.token_expiry(),
                    "downstream token refreshed"
                );
                telemetry::record_tier(tier, "success");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    %tier,
                    outcome = e.outcome(),
                    error = %e,
                    "downstream refresh failed, falling back to bridge credential"
                );
                telemetry::record_tier(tier, e.outcome());
                Ok(false)
            }
        }
    }

    /// Tiers 2 through 4.
    async fn issue_with_bridge(&self, session: &mut Session) -> Result<()> {
        let bridge = session.bundle.bridge_credential.clone();
        match bridge.active() {
            ActiveBridge::None => Err(self.manual_reauthorization(
                "downstream refresh unavailable and no bridge credential is configured",
            )),
            ActiveBridge::Manual(token) => match self.issue(session, token).await? {
                None => Ok(()),
                Some(e) if e.is_auth() => Err(self.manual_reauthorization(
                    "manual bridge token rejected and no OAuth bridge is configured",
                )),
                Some(e) => Err(issuance_error(e)),
            },
            ActiveBridge::OAuth(oauth) => self.issue_with_oauth(session, oauth).await,
        }
    }

    async fn issue_with_oauth(&self, session: &mut Session, oauth: &OAuthBridge) -> Result<()> {
        match oauth.access_token.as_ref().filter(|t| !t.is_blank()) {
            Some(cached) => match self.issue(session, cached).await? {
                None => return Ok(()),
                Some(e) if e.is_auth() => {
                    info!("cached OAuth bridge token rejected, refreshing it");
                }
                Some(e) => return Err(issuance_error(e)),
            },
            None => {
                info!(
                    tier = %Tier::BridgeIssue,
                    outcome = "skipped",
                    "no OAuth bridge token minted yet"
                );
                telemetry::record_tier(Tier::BridgeIssue, "skipped");
            }
        }

        let bridge_token = self.refresh_oauth_bridge(session, oauth).await?;
        match self.issue(session, &bridge_token).await? {
            None => Ok(()),
            Some(e) if e.is_auth() => Err(Error::AuthenticationFailed(format!(
                "freshly minted bridge token was rejected: {e}"
            ))),
            Some(e) => Err(issuance_error(e)),
        }
    }

    /// Tier 2, one attempt. `Ok(Some(_))` carries the endpoint failure for
    /// the caller to classify; `Err` is a store failure after success.
    async fn issue(
        &self,
        session: &mut Session,
        bridge_token: &Secret<String>,
    ) -> Result<Option<EndpointError>> {
        let tier = Tier::BridgeIssue;
        self.check_deadline("bridge token issuance")?;
        match self
            .api
            .issue(&session.bundle.service_identity, bridge_token)
            .await
        {
            Ok(response) => {
                self.accept_downstream(session, response).await?;
                info!(
                    %tier,
                    outcome = "success",
                    expires = session.token_expiry(),
                    "downstream token issued with bridge credential"
                );
                telemetry::record_tier(tier, "success");
                Ok(None)
            }
            Err(e) => {
                warn!(%tier, outcome = e.outcome(), error = %e, "token issuance failed");
                telemetry::record_tier(tier, e.outcome());
                Ok(Some(e))
            }
        }
    }

    /// Tier 3. Persists the new bridge token (and a rotated refresh token)
    /// before returning it.
    async fn refresh_oauth_bridge(
        &self,
        session: &mut Session,
        oauth: &OAuthBridge,
    ) -> Result<Secret<String>> {
        let tier = Tier::OAuthBridgeRefresh;
        self.check_deadline("OAuth bridge refresh")?;
        let grant = match self.oauth.refresh(oauth).await {
            Ok(grant) => grant,
            Err(webex_auth::Error::RefreshTokenExpired(reason)) => {
                warn!(
                    %tier,
                    outcome = "auth_rejected",
                    reason = %reason,
                    "OAuth bridge refresh token rejected"
                );
                telemetry::record_tier(tier, "auth_rejected");
                return Err(self.manual_reauthorization(&format!(
                    "OAuth bridge refresh token rejected: {reason}"
                )));
            }
            Err(e) => {
                let outcome = match &e {
                    webex_auth::Error::TransientRefreshFailure(_) => "transient",
                    _ => "rejected",
                };
                warn!(%tier, outcome, error = %e, "OAuth bridge refresh failed");
                telemetry::record_tier(tier, outcome);
                return Err(e.into());
            }
        };

        let rotated = grant.refresh_token.is_some();
        if let Some(bridge) = session.bundle.bridge_credential.oauth.as_mut() {
            bridge.access_token = Some(grant.access_token.clone());
            bridge.expires = grant.expires_in.map(|secs| expires_at(now_millis(), secs));
            if let Some(refresh_token) = grant.refresh_token {
                bridge.refresh_token = refresh_token;
            }
        }
        session.bundle = self.store.save(&session.bundle).await?;

        info!(%tier, outcome = "success", rotated, "OAuth bridge token refreshed");
        telemetry::record_tier(tier, "success");
        Ok(grant.access_token)
    }

    async fn accept_downstream(&self, session: &mut Session, response: TokenResponse) -> Result<()> {
        session.bundle.downstream_token.renew(
            response.access_token,
            response.refresh_token,
            response.expires_in,
            now_millis(),
        );
        session.bundle = self.store.save(&session.bundle).await?;
        Ok(())
    }

    fn manual_reauthorization(&self, reason: &str) -> Error {
        error!(
            tier = %Tier::Terminal,
            outcome = "reached",
            alert = "manual_reauthorization_required",
            reason,
            "automated token recovery exhausted, operator must re-authorize the bridge credential"
        );
        telemetry::record_tier(Tier::Terminal, "reached");
        telemetry::record_manual_reauthorization();
        Error::ManualReauthorizationRequired(reason.to_string())
    }
}

fn issuance_error(err: EndpointError) -> Error {
    match err {
        EndpointError::Transient(msg) => {
            Error::TransientFailure(format!("token issuance failed: {msg}"))
        }
        other => Error::AuthenticationFailed(format!("token issuance rejected: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, LogCapture, OAUTH_PATH, bundle};
    use mockito::Matcher;
    use serde_json::json;
    use webex_auth::{CredentialStore, MemoryBackend};

    const ISSUE_PATH: &str = "/v1/applications/app-1/token";

    fn refresh_grant(token: &str) -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), token.into()),
        ])
    }

    #[tokio::test]
    async fn valid_token_costs_one_probe_and_no_refresh() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_live", "refreshToken": "rt_1"}),
            json!({"personalAccessToken": "pat_1"}),
        ))
        .await;
        let probe = fx.probe("at_live", 200, 1).await;
        let tier1 = fx.server.mock("POST", "/v1/access_token").expect(0).create_async().await;
        let issue = fx.server.mock("POST", ISSUE_PATH).expect(0).create_async().await;

        let mut session = fx.manager.start_session().await.unwrap();
        let token = fx.manager.ensure_valid_token(&mut session).await.unwrap();
        assert_eq!(token.expose(), "at_live");
        assert_eq!(session.state(), TokenState::Valid);

        // Second call in the same session trusts the earlier probe
        fx.manager.ensure_valid_token(&mut session).await.unwrap();

        probe.assert_async().await;
        tier1.assert_async().await;
        issue.assert_async().await;
        assert_eq!(fx.backend.writes(), 0);
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_with_downstream_refresh_token() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old", "refreshToken": "rt_1"}),
            json!({"personalAccessToken": "pat_1"}),
        ))
        .await;
        let probe = fx.probe("at_old", 401, 1).await;
        let tier1 = fx
            .server
            .mock("POST", "/v1/access_token")
            .match_body(Matcher::AllOf(vec![
                refresh_grant("rt_1"),
                Matcher::UrlEncoded("client_id".into(), "svc-client".into()),
                Matcher::UrlEncoded("client_secret".into(), "svc-secret".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"at_new","refresh_token":"rt_2","expires_in":1209600}"#)
            .expect(1)
            .create_async()
            .await;
        let issue = fx.server.mock("POST", ISSUE_PATH).expect(0).create_async().await;

        let mut session = fx.manager.start_session().await.unwrap();
        let token = fx.manager.ensure_valid_token(&mut session).await.unwrap();
        assert_eq!(token.expose(), "at_new");

        probe.assert_async().await;
        tier1.assert_async().await;
        issue.assert_async().await;

        let stored = fx.persisted();
        assert_eq!(stored.downstream_token.access_token.unwrap().expose(), "at_new");
        assert_eq!(stored.downstream_token.refresh_token.unwrap().expose(), "rt_2");
        assert!(stored.downstream_token.expires.unwrap() > now_millis());
    }

    #[tokio::test]
    async fn missing_refresh_token_uses_manual_bridge() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old"}),
            json!({"personalAccessToken": "pat_1"}),
        ))
        .await;
        let _probe = fx.probe("at_old", 401, 1).await;
        let tier1 = fx.server.mock("POST", "/v1/access_token").expect(0).create_async().await;
        let oauth = fx.server.mock("POST", OAUTH_PATH).expect(0).create_async().await;
        let issue = fx
            .server
            .mock("POST", ISSUE_PATH)
            .match_header("authorization", "Bearer pat_1")
            .with_status(200)
            .with_body(r#"{"access_token":"at_issued","refresh_token":"rt_issued","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let token = fx.manager.ensure_valid_token(&mut session).await.unwrap();
        assert_eq!(token.expose(), "at_issued");

        tier1.assert_async().await;
        oauth.assert_async().await;
        issue.assert_async().await;
        let stored = fx.persisted();
        assert_eq!(stored.downstream_token.refresh_token.unwrap().expose(), "rt_issued");
    }

    #[tokio::test]
    async fn failed_downstream_refresh_falls_through_to_bridge() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old", "refreshToken": "rt_revoked"}),
            json!({"personalAccessToken": "pat_1"}),
        ))
        .await;
        let _probe = fx.probe("at_old", 401, 1).await;
        let tier1 = fx
            .server
            .mock("POST", "/v1/access_token")
            .with_status(400)
            .with_body(r#"{"message":"invalid refresh token"}"#)
            .expect(1)
            .create_async()
            .await;
        let issue = fx
            .server
            .mock("POST", ISSUE_PATH)
            .with_status(200)
            .with_body(r#"{"access_token":"at_issued"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        fx.manager.ensure_valid_token(&mut session).await.unwrap();

        tier1.assert_async().await;
        issue.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_bridge_token_triggers_one_oauth_exchange() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old"}),
            json!({"oauth": {
                "clientId": "integration-id",
                "clientSecret": "integration-secret",
                "refreshToken": "ort_1",
                "accessToken": "bat_old"
            }}),
        ))
        .await;
        let _probe = fx.probe("at_old", 401, 1).await;
        let stale_issue = fx
            .server
            .mock("POST", ISSUE_PATH)
            .match_header("authorization", "Bearer bat_old")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let oauth = fx
            .server
            .mock("POST", OAUTH_PATH)
            .match_body(Matcher::AllOf(vec![
                refresh_grant("ort_1"),
                Matcher::UrlEncoded("client_id".into(), "integration-id".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"bat_new","refresh_token":"ort_2","expires_in":1209600}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh_issue = fx
            .server
            .mock("POST", ISSUE_PATH)
            .match_header("authorization", "Bearer bat_new")
            .with_status(200)
            .with_body(r#"{"access_token":"at_issued","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let token = fx.manager.ensure_valid_token(&mut session).await.unwrap();
        assert_eq!(token.expose(), "at_issued");

        stale_issue.assert_async().await;
        oauth.assert_async().await;
        fresh_issue.assert_async().await;

        let stored = fx.persisted();
        let bridge = stored.bridge_credential.oauth.unwrap();
        assert_eq!(bridge.refresh_token.expose(), "ort_2");
        assert_eq!(bridge.access_token.unwrap().expose(), "bat_new");
        assert_eq!(stored.downstream_token.access_token.unwrap().expose(), "at_issued");
    }

    #[tokio::test]
    async fn oauth_without_minted_token_refreshes_before_issuing() {
        let mut fx = Fixture::new(bundle(
            json!({}),
            json!({"oauth": {
                "clientId": "integration-id",
                "clientSecret": "integration-secret",
                "refreshToken": "ort_1"
            }}),
        ))
        .await;
        let probe = fx.server.mock("GET", "/v1/people/me").expect(0).create_async().await;
        let oauth = fx
            .server
            .mock("POST", OAUTH_PATH)
            .with_status(200)
            .with_body(r#"{"access_token":"bat_1"}"#)
            .expect(1)
            .create_async()
            .await;
        let issue = fx
            .server
            .mock("POST", ISSUE_PATH)
            .match_header("authorization", "Bearer bat_1")
            .with_status(200)
            .with_body(r#"{"access_token":"at_issued"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        fx.manager.ensure_valid_token(&mut session).await.unwrap();

        probe.assert_async().await;
        oauth.assert_async().await;
        issue.assert_async().await;
        let bridge = fx.persisted().bridge_credential.oauth.unwrap();
        // Not rotated: the stored refresh token stays
        assert_eq!(bridge.refresh_token.expose(), "ort_1");
    }

    #[tokio::test]
    async fn rejected_oauth_refresh_token_requires_manual_reauthorization() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old"}),
            json!({"oauth": {
                "clientId": "integration-id",
                "clientSecret": "integration-secret",
                "refreshToken": "ort_dead",
                "accessToken": "bat_old"
            }}),
        ))
        .await;
        let _probe = fx.probe("at_old", 401, 1).await;
        // Only the cached bridge token is ever presented
        let issue = fx
            .server
            .mock("POST", ISSUE_PATH)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let oauth = fx
            .server
            .mock("POST", OAUTH_PATH)
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let err = fx.manager.ensure_valid_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::ManualReauthorizationRequired(_)), "got {err:?}");
        assert!(err.requires_operator());

        issue.assert_async().await;
        oauth.assert_async().await;
        assert_eq!(fx.backend.writes(), 0);
    }

    #[tokio::test]
    async fn rejected_manual_bridge_requires_manual_reauthorization() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old"}),
            json!({"personalAccessToken": "pat_expired"}),
        ))
        .await;
        let _probe = fx.probe("at_old", 401, 1).await;
        let _mock = fx
            .server
            .mock("POST", ISSUE_PATH)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let err = fx.manager.ensure_valid_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::ManualReauthorizationRequired(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn no_bridge_and_no_refresh_token_requires_manual_reauthorization() {
        let mut fx = Fixture::new(bundle(json!({"accessToken": "at_old"}), json!({}))).await;
        let _probe = fx.probe("at_old", 401, 1).await;

        let mut session = fx.manager.start_session().await.unwrap();
        let err = fx.manager.ensure_valid_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::ManualReauthorizationRequired(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn freshly_minted_bridge_token_rejected_is_authentication_failure() {
        let mut fx = Fixture::new(bundle(
            json!({}),
            json!({"oauth": {
                "clientId": "integration-id",
                "clientSecret": "integration-secret",
                "refreshToken": "ort_1"
            }}),
        ))
        .await;
        let _mock = fx
            .server
            .mock("POST", OAUTH_PATH)
            .with_status(200)
            .with_body(r#"{"access_token":"bat_1"}"#)
            .expect(1)
            .create_async()
            .await;
        let issue = fx
            .server
            .mock("POST", ISSUE_PATH)
            .with_status(403)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let err = fx.manager.ensure_valid_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)), "got {err:?}");
        issue.assert_async().await;
    }

    #[tokio::test]
    async fn issuance_outage_is_transient() {
        let mut fx = Fixture::new(bundle(json!({}), json!({"personalAccessToken": "pat_1"}))).await;
        let _mock = fx
            .server
            .mock("POST", ISSUE_PATH)
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let err = fx.manager.ensure_valid_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::TransientFailure(_)), "got {err:?}");
        assert_eq!(fx.backend.writes(), 0);
    }

    #[tokio::test]
    async fn probe_outage_is_transient_and_skips_refresh() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_live", "refreshToken": "rt_1"}),
            json!({"personalAccessToken": "pat_1"}),
        ))
        .await;
        let _probe = fx.probe("at_live", 502, 1).await;
        let tier1 = fx.server.mock("POST", "/v1/access_token").expect(0).create_async().await;

        let mut session = fx.manager.start_session().await.unwrap();
        let err = fx.manager.ensure_valid_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::TransientFailure(_)), "got {err:?}");
        tier1.assert_async().await;
    }

    #[tokio::test]
    async fn locally_expired_token_skips_probe() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old", "refreshToken": "rt_1", "expires": now_millis() - 1000}),
            json!({}),
        ))
        .await;
        let probe = fx.server.mock("GET", "/v1/people/me").expect(0).create_async().await;
        let _mock = fx
            .server
            .mock("POST", "/v1/access_token")
            .with_status(200)
            .with_body(r#"{"access_token":"at_new"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let token = fx.manager.ensure_valid_token(&mut session).await.unwrap();
        assert_eq!(token.expose(), "at_new");
        probe.assert_async().await;

        // The refresh token was not rotated, so it is kept
        let stored = fx.persisted();
        assert_eq!(stored.downstream_token.refresh_token.unwrap().expose(), "rt_1");
        assert_eq!(stored.downstream_token.expires, None);
    }

    #[tokio::test]
    async fn expiry_inside_margin_counts_as_expired() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old", "refreshToken": "rt_1", "expires": now_millis() + 30_000}),
            json!({}),
        ))
        .await;
        let probe = fx.server.mock("GET", "/v1/people/me").expect(0).create_async().await;
        let _mock = fx
            .server
            .mock("POST", "/v1/access_token")
            .with_status(200)
            .with_body(r#"{"access_token":"at_new"}"#)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        fx.manager.ensure_valid_token(&mut session).await.unwrap();
        probe.assert_async().await;
    }

    #[tokio::test]
    async fn repeated_forced_refresh_rotates_each_time() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_1", "refreshToken": "rt_1"}),
            json!({}),
        ))
        .await;
        let probe = fx.server.mock("GET", "/v1/people/me").expect(0).create_async().await;
        let first = fx
            .server
            .mock("POST", "/v1/access_token")
            .match_body(refresh_grant("rt_1"))
            .with_status(200)
            .with_body(r#"{"access_token":"at_2","refresh_token":"rt_2","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let second = fx
            .server
            .mock("POST", "/v1/access_token")
            .match_body(refresh_grant("rt_2"))
            .with_status(200)
            .with_body(r#"{"access_token":"at_3","refresh_token":"rt_3","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        fx.manager.force_refresh(&mut session).await.unwrap();
        let after_first = session.access_token().unwrap().clone();
        fx.manager.force_refresh(&mut session).await.unwrap();
        let after_second = session.access_token().unwrap().clone();

        assert_ne!(after_first, after_second);
        assert_eq!(after_second.expose(), "at_3");
        probe.assert_async().await;
        first.assert_async().await;
        second.assert_async().await;

        let stored = fx.persisted();
        assert_eq!(stored.downstream_token.access_token.unwrap().expose(), "at_3");
        assert_eq!(stored.downstream_token.refresh_token.unwrap().expose(), "rt_3");
    }

    #[tokio::test]
    async fn overlapping_invocations_keep_each_others_rotations() {
        let initial = bundle(
            json!({"accessToken": "at_old", "refreshToken": "rt_1"}),
            json!({"oauth": {
                "clientId": "integration-id",
                "clientSecret": "integration-secret",
                "refreshToken": "ort_1",
                "accessToken": "bat_old"
            }}),
        );

        // Invocation A: downstream refresh fails, bridge is renewed through OAuth
        let mut a = Fixture::new(initial.clone()).await;
        let _mock = a
            .server
            .mock("POST", "/v1/access_token")
            .with_status(400)
            .create_async()
            .await;
        let _mock = a
            .server
            .mock("POST", ISSUE_PATH)
            .match_header("authorization", "Bearer bat_old")
            .with_status(401)
            .create_async()
            .await;
        let _mock = a
            .server
            .mock("POST", OAUTH_PATH)
            .with_status(200)
            .with_body(r#"{"access_token":"bat_new","refresh_token":"ort_2"}"#)
            .create_async()
            .await;
        let _mock = a
            .server
            .mock("POST", ISSUE_PATH)
            .match_header("authorization", "Bearer bat_new")
            .with_status(200)
            .with_body(r#"{"access_token":"at_a"}"#)
            .create_async()
            .await;

        // Invocation B shares A's store but talks to its own server
        let mut b = Fixture::with_backend(a.backend.clone()).await;
        let _mock = b
            .server
            .mock("POST", "/v1/access_token")
            .match_body(refresh_grant("rt_1"))
            .with_status(200)
            .with_body(r#"{"access_token":"at_b","refresh_token":"rt_2"}"#)
            .create_async()
            .await;

        let mut session_a = a.manager.start_session().await.unwrap();
        let mut session_b = b.manager.start_session().await.unwrap();

        a.manager.force_refresh(&mut session_a).await.unwrap();
        b.manager.force_refresh(&mut session_b).await.unwrap();

        let stored = a.persisted();
        let bridge = stored.bridge_credential.oauth.unwrap();
        assert_eq!(bridge.refresh_token.expose(), "ort_2");
        assert_eq!(bridge.access_token.unwrap().expose(), "bat_new");
        assert_eq!(stored.downstream_token.access_token.unwrap().expose(), "at_b");
        assert_eq!(stored.downstream_token.refresh_token.unwrap().expose(), "rt_2");

        // B's session also picked up A's rotation through the merge
        let b_bridge = session_b.bundle().bridge_credential.oauth.clone().unwrap();
        assert_eq!(b_bridge.refresh_token.expose(), "ort_2");
    }

    #[tokio::test]
    async fn store_failure_is_surfaced() {
        let server = mockito::Server::new_async().await;
        let client = reqwest::Client::new();
        let manager = TokenManager::new(
            CredentialStore::new(MemoryBackend::empty()),
            DownstreamApi::new(client.clone(), server.url(), "/v1/people/me"),
            OAuthRefresher::new(client, format!("{}{}", server.url(), OAUTH_PATH)),
        );

        let err = manager.start_session().await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)), "got {err:?}");
    }

    fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
        expected
            .iter()
            .map(|(tier, outcome)| (tier.to_string(), outcome.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn every_tier_attempt_is_logged_through_to_terminal() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old", "refreshToken": "rt_1"}),
            json!({"oauth": {
                "clientId": "oc",
                "clientSecret": "os",
                "refreshToken": "ort_dead",
                "accessToken": "oat_stale"
            }}),
        ))
        .await;
        let _probe = fx.probe("at_old", 401, 1).await;
        let _tier1 = fx
            .server
            .mock("POST", "/v1/access_token")
            .with_status(400)
            .with_body(r#"{"message":"bad refresh token"}"#)
            .expect(1)
            .create_async()
            .await;
        let _issue = fx
            .server
            .mock("POST", ISSUE_PATH)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let _oauth = fx
            .server
            .mock("POST", OAUTH_PATH)
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let err = fx.manager.ensure_valid_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::ManualReauthorizationRequired(_)), "got {err:?}");

        assert_eq!(
            logs.tier_outcomes(),
            pairs(&[
                ("downstream_refresh", "rejected"),
                ("bridge_issue", "auth_rejected"),
                ("oauth_bridge_refresh", "auth_rejected"),
                ("terminal", "reached"),
            ])
        );
        let fields = logs.fields();
        assert!(
            fields.iter().any(|f| f["probe"] == "invalid"),
            "token validity check must be logged"
        );
        assert!(
            fields
                .iter()
                .any(|f| f["tier"] == "terminal" && f["alert"] == "manual_reauthorization_required"),
            "terminal line must carry the operator alert"
        );
    }

    #[tokio::test]
    async fn recovered_cascade_logs_each_tier_outcome() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old"}),
            json!({"oauth": {
                "clientId": "oc",
                "clientSecret": "os",
                "refreshToken": "ort_1",
                "accessToken": "oat_stale"
            }}),
        ))
        .await;
        let _probe = fx.probe("at_old", 401, 1).await;
        let _stale = fx
            .server
            .mock("POST", ISSUE_PATH)
            .match_header("authorization", "Bearer oat_stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let _oauth = fx
            .server
            .mock("POST", OAUTH_PATH)
            .with_status(200)
            .with_body(r#"{"access_token":"oat_fresh","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let _fresh = fx
            .server
            .mock("POST", ISSUE_PATH)
            .match_header("authorization", "Bearer oat_fresh")
            .with_status(200)
            .with_body(r#"{"access_token":"at_new","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let mut session = fx.manager.start_session().await.unwrap();
        let token = fx.manager.ensure_valid_token(&mut session).await.unwrap();
        assert_eq!(token.expose(), "at_new");

        assert_eq!(
            logs.tier_outcomes(),
            pairs(&[
                ("downstream_refresh", "skipped"),
                ("bridge_issue", "auth_rejected"),
                ("oauth_bridge_refresh", "success"),
                ("bridge_issue", "success"),
            ])
        );
    }

    #[tokio::test]
    async fn passed_deadline_stops_before_any_network_call() {
        let mut fx = Fixture::new(bundle(
            json!({"accessToken": "at_old", "refreshToken": "rt_1"}),
            json!({"personalAccessToken": "pat_1"}),
        ))
        .await;
        let probe = fx.probe("at_old", 401, 0).await;
        let tier1 = fx.server.mock("POST", "/v1/access_token").expect(0).create_async().await;
        let manager = fx.manager.with_deadline(Instant::now());

        let mut session = manager.start_session().await.unwrap();
        let err = manager.ensure_valid_token(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::TransientFailure(_)), "got {err:?}");

        let err = manager.force_refresh(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::TransientFailure(_)), "got {err:?}");

        probe.assert_async().await;
        tier1.assert_async().await;
        assert_eq!(fx.backend.writes(), 0);
    }

    #[tokio::test]
    async fn future_deadline_does_not_interfere() {
        let mut fx = Fixture::new(bundle(json!({"accessToken": "at_live"}), json!({}))).await;
        let _probe = fx.probe("at_live", 200, 1).await;
        let manager = fx
            .manager
            .with_deadline(Instant::now() + Duration::from_secs(300));

        let mut session = manager.start_session().await.unwrap();
        let token = manager.ensure_valid_token(&mut session).await.unwrap();
        assert_eq!(token.expose(), "at_live");
    }
}
