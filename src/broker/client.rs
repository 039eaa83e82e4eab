// =============================================================================
// Broker Client — authenticated HTTP transport to the broker's web portal
// =============================================================================
//
// The raw login redirect flow (the browser-facing OAuth-like dance) is an
// external collaborator, out of scope here: `obtain_session` assumes the
// portal's gateway exposes a direct credentials endpoint for the configured
// account, matching how a paper/live gateway session is normally bootstrapped
// without a browser. Cookies are held by a shared `reqwest::Client` cookie
// jar so every subsequent request naturally replays the `cp` session cookie.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::cookie::CookieStore;
use reqwest::Url;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::error::IngestError;

const PAPER_BASE: &str = "https://localhost:5000/v1/api";
const LIVE_BASE: &str = "https://localhost:5000/v1/api";

/// A single history bar as returned by `historyRequest`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryBar {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

#[derive(Debug, Deserialize)]
struct SsoValidateResponse {
    #[serde(rename = "USER_ID")]
    user_id: Option<i64>,
    #[serde(rename = "_ERROR")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IserverAuthStatusResponse {
    authenticated: Option<bool>,
    #[serde(rename = "_ERROR")]
    error: Option<String>,
}

#[derive(Debug, Default)]
struct SessionState {
    sso_user_id: Option<i64>,
    iserver_authenticated: bool,
}

/// Authenticated HTTP transport to the broker's Client Portal gateway.
/// Holds the session state (cookies, SSO user id, iserver auth flag); that
/// state is mutated exclusively by the Session Keeper, read by the Tick
/// Streamer and Bar Reconciler.
#[derive(Clone)]
pub struct BrokerClient {
    username: String,
    password: String,
    base_url: String,
    client: reqwest::Client,
    jar: Arc<reqwest::cookie::Jar>,
    state: Arc<RwLock<SessionState>>,
}

impl BrokerClient {
    pub fn new(username: impl Into<String>, password: impl Into<String>, paper: bool) -> Self {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        Self {
            username: username.into(),
            password: password.into(),
            base_url: if paper { PAPER_BASE } else { LIVE_BASE }.to_string(),
            client,
            jar,
            state: Arc::new(RwLock::new(SessionState::default())),
        }
    }

    /// Rehydrate cookies from shared session storage. The cookie jar on the
    /// shared `reqwest::Client` is the storage; this is a no-op placeholder
    /// seam for a deployment that persists cookies across process restarts.
    pub fn load_session(&self) {}

    /// The named cookie's value as currently held by the client's jar
    /// (e.g. `cookie("cp")` for the Tick Streamer's socket handshake).
    pub fn cookie(&self, name: &str) -> Option<String> {
        let url: Url = self.base_url.parse().ok()?;
        let header = self.jar.cookies(&url)?;
        let header = header.to_str().ok()?;
        header.split("; ").find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }

    pub fn socket_url(&self) -> String {
        "wss://localhost:5000/v1/api/ws".to_string()
    }

    #[instrument(skip(self), fields(endpoint = "sso/validate"))]
    pub async fn sso_validate(&self) -> Result<bool, IngestError> {
        let url = format!("{}/sso/validate", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body: SsoValidateResponse = resp.json().await.unwrap_or(SsoValidateResponse {
            user_id: None,
            error: Some("unparseable response".into()),
        });

        if !status.is_success() || body.error.is_some() || body.user_id.is_none() {
            warn!(status = %status, "sso/validate failed");
            return Ok(false);
        }

        self.state.write().sso_user_id = body.user_id;
        Ok(true)
    }

    #[instrument(skip(self), fields(endpoint = "iserver/auth/status"))]
    pub async fn iserver_auth_status(&self) -> Result<bool, IngestError> {
        let url = format!("{}/iserver/auth/status", self.base_url);
        let resp = self.client.post(&url).send().await?;
        let body: IserverAuthStatusResponse = resp.json().await?;

        if body.error.is_some() {
            return Err(IngestError::Protocol(format!(
                "iserver/auth/status error: {:?}",
                body.error
            )));
        }

        let authenticated = body.authenticated.unwrap_or(false);
        self.state.write().iserver_authenticated = authenticated;
        Ok(authenticated)
    }

    #[instrument(skip(self), fields(endpoint = "iserver/reauthenticate"))]
    pub async fn init_iserver_session(&self) -> Result<bool, IngestError> {
        let url = format!("{}/iserver/reauthenticate", self.base_url);
        let resp = self.client.post(&url).send().await?;
        let body: IserverAuthStatusResponse = resp.json().await.unwrap_or(IserverAuthStatusResponse {
            authenticated: Some(false),
            error: None,
        });
        let authenticated = body.authenticated.unwrap_or(false);
        self.state.write().iserver_authenticated = authenticated;
        Ok(authenticated)
    }

    #[instrument(skip(self), fields(endpoint = "logout"))]
    pub async fn portal_logout(&self) -> Result<(), IngestError> {
        let url = format!("{}/logout", self.base_url);
        self.client.post(&url).send().await?;
        self.state.write().iserver_authenticated = false;
        Ok(())
    }

    #[instrument(skip(self), fields(endpoint = "sso/logout"))]
    pub async fn sso_logout(&self) -> Result<(), IngestError> {
        let url = format!("{}/sso/logout", self.base_url);
        self.client.post(&url).send().await?;
        self.state.write().sso_user_id = None;
        Ok(())
    }

    /// Bootstrap a brand-new session against the gateway's direct
    /// credentials endpoint. Returns `false` (never an error) on a rejected
    /// login so the Session Keeper's retry-with-backoff loop can proceed.
    #[instrument(skip(self), fields(endpoint = "iserver/auth/ssodh/init"))]
    pub async fn obtain_session(&self) -> Result<bool, IngestError> {
        let url = format!("{}/iserver/auth/ssodh/init", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "obtain_session transport failure");
                return Ok(false);
            }
        };

        Ok(resp.status().is_success())
    }

    #[instrument(skip(self), fields(endpoint = "tickle"))]
    pub async fn keep_session_alive(&self) -> Result<(), IngestError> {
        let url = format!("{}/tickle", self.base_url);
        self.client.post(&url).send().await?;
        Ok(())
    }

    /// Request up to ~1000 minutes of one-minute history for `conid`.
    /// Callers are responsible for keeping `period_minutes` under the
    /// broker's per-request ceiling.
    #[instrument(skip(self), fields(conid, period_minutes))]
    pub async fn history_request(
        &self,
        conid: i64,
        period_minutes: i64,
    ) -> Result<Vec<HistoryBar>, IngestError> {
        let url = format!(
            "{}/iserver/marketdata/history?conid={}&period={}min&bar=1min&outsideRth=true",
            self.base_url, conid, period_minutes
        );
        let resp = self.client.get(&url).send().await?.error_for_status()?;

        #[derive(Deserialize)]
        struct HistoryResponse {
            data: Vec<HistoryBar>,
        }
        let body: HistoryResponse = resp.json().await?;
        Ok(body.data)
    }
}
