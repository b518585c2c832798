//! Challenge-response sessions
//!
//! A session is opened by proving possession of the app_token without sending
//! it: the device issues a single-use challenge and expects
//! `hex(HMAC-SHA1(key = app_token, message = challenge))` back as password.
//!
//! The cached `Session` is the only mutable state of a client. It is replaced
//! only while the renewal guard is held, so concurrent callers that detect
//! the same expired token wait for one login instead of racing their own.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::protocol::{self, ChallengeInfo, Session, SessionStart};
use crate::transport::{HttpRequest, Transport, join_url};

/// Header carrying the session token on authenticated calls
pub const AUTH_HEADER: &str = "X-Fbx-App-Auth";

type HmacSha1 = Hmac<Sha1>;

/// Lower-case hex HMAC-SHA1 of `challenge` keyed by `app_token`
pub fn derive_password(app_token: &str, challenge: &str) -> String {
    let Ok(mut mac) = HmacSha1::new_from_slice(app_token.as_bytes()) else {
        unreachable!("HMAC key of any size is valid")
    };
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Long-lived credential a session is opened from
#[derive(Debug, Clone)]
pub(crate) struct Credentials {
    pub app_id: String,
    pub app_token: String,
    pub app_version: Option<String>,
}

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    api_root: String,
    credentials: Credentials,
    session: RwLock<Option<Session>>,
    renewal: Mutex<()>,
}

impl SessionManager {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        api_root: String,
        credentials: Credentials,
    ) -> Self {
        Self {
            transport,
            api_root,
            credentials,
            session: RwLock::new(None),
            renewal: Mutex::new(()),
        }
    }

    /// Snapshot of the current session
    pub async fn current(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    pub async fn session_token(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.session_token.clone())
    }

    /// Unauthenticated `GET login`
    pub async fn get_challenge(&self) -> Result<ChallengeInfo> {
        let resp = self
            .transport
            .send(HttpRequest::get(join_url(&self.api_root, "login")))
            .await?;

        let body: Value = protocol::payload(resp.status, resp.body)?;
        match body.get("challenge").and_then(Value::as_str) {
            Some(challenge) => Ok(ChallengeInfo {
                challenge: challenge.to_string(),
                logged_in: body.get("logged_in").and_then(Value::as_bool).unwrap_or(false),
            }),
            None => Err(Error::InvalidResponse(
                "Unable to retrieve challenge to open a session".to_string(),
            )),
        }
    }

    /// Open a session, fetching a challenge first when none is given.
    pub async fn login(&self, challenge: Option<&str>) -> Result<Session> {
        let _guard = self.renewal.lock().await;
        self.open_session(challenge).await
    }

    /// Renew after `stale_token` was rejected with `challenge`.
    ///
    /// When another caller already replaced `stale_token` while this one was
    /// waiting on the guard, its session is reused and no login is made.
    pub async fn renew(&self, stale_token: Option<&str>, challenge: &str) -> Result<Session> {
        let _guard = self.renewal.lock().await;

        if let Some(current) = self.current().await {
            if Some(current.session_token.as_str()) != stale_token {
                tracing::debug!("session already renewed by a concurrent request");
                return Ok(current);
            }
        }

        tracing::debug!("session expired, opening a new one");
        self.open_session(Some(challenge)).await
    }

    /// Log in unless a session is already held.
    pub async fn ensure(&self) -> Result<Session> {
        let _guard = self.renewal.lock().await;
        match self.current().await {
            Some(session) => Ok(session),
            None => self.open_session(None).await,
        }
    }

    /// `POST login/logout` with the current session. The cached session is
    /// left alone; clearing it is the caller's decision.
    pub async fn logout(&self) -> Result<bool> {
        let mut req = HttpRequest::post(join_url(&self.api_root, "login/logout"));
        if let Some(token) = self.session_token().await {
            req = req.header(AUTH_HEADER, token);
        }

        let resp = self.transport.send(req).await?;
        Ok(resp
            .body
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Drop the cached session.
    pub async fn clear(&self) {
        let _guard = self.renewal.lock().await;
        *self.session.write().await = None;
    }

    // Caller holds the renewal guard.
    async fn open_session(&self, challenge: Option<&str>) -> Result<Session> {
        let challenge = match challenge {
            Some(c) => c.to_string(),
            None => self.get_challenge().await?.challenge,
        };

        let start = SessionStart {
            app_id: &self.credentials.app_id,
            app_version: self
                .credentials
                .app_version
                .as_deref()
                .filter(|v| !v.is_empty()),
            password: derive_password(&self.credentials.app_token, &challenge),
        };
        let body =
            serde_json::to_value(&start).map_err(|e| Error::InvalidResponse(e.to_string()))?;

        let resp = self
            .transport
            .send(HttpRequest::post(join_url(&self.api_root, "login/session")).json(body))
            .await?;

        let session: Session = protocol::payload(resp.status, resp.body)?;
        *self.session.write().await = Some(session.clone());

        tracing::debug!(app_id = %self.credentials.app_id, "session opened");
        Ok(session)
    }
}
