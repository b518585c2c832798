//! One-time application registration
//!
//! Registration needs a human to confirm the request on the device itself:
//! - Discover the API version and remote endpoint from the local URL
//! - Ask for an authorization, which yields the app_token and a track_id
//! - Poll the track every tick until the device reports a terminal status
//!
//! A rejected or failed attempt is final; call `register` again to retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::AppIdentity;
use crate::protocol::{
    self, AppRegistration, AuthorizationGrant, AuthorizationStatus, AuthorizationTrack, Discovery,
};
use crate::transport::{HttpRequest, HttpTransport, Transport, join_url};

/// Identifier of one in-progress authorization
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackId(String);

impl TrackId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn invalid_track_id() -> Error {
    Error::Validation(vec![
        "track_id must be a non-empty string or a non-zero number".to_string(),
    ])
}

impl TryFrom<&str> for TrackId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(invalid_track_id());
        }
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for TrackId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::try_from(value.as_str())
    }
}

impl TryFrom<u64> for TrackId {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        if value == 0 {
            return Err(invalid_track_id());
        }
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<&Value> for TrackId {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::try_from(s.as_str()),
            Value::Number(n) => match n.as_u64() {
                Some(id) => Self::try_from(id),
                None => Err(invalid_track_id()),
            },
            _ => Err(invalid_track_id()),
        }
    }
}

impl TryFrom<Value> for TrackId {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::try_from(&value)
    }
}

impl TryFrom<&TrackId> for TrackId {
    type Error = Error;

    fn try_from(value: &TrackId) -> Result<Self> {
        Ok(value.clone())
    }
}

/// Authorization requested, waiting for confirmation on the device
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub app_token: String,
    pub track_id: TrackId,
    pub discovery: Discovery,
    pub api_root: String,
}

/// Drives the registration handshake
pub struct AppRegistrar {
    identity: AppIdentity,
    transport: Arc<dyn Transport>,
    local_url: String,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl AppRegistrar {
    /// Registrar talking to the device over HTTPS with the configured trust anchor
    pub fn new(identity: AppIdentity, config: &Config) -> Result<Self> {
        let trust = config.device.trust.anchor()?;
        let transport = HttpTransport::new(&trust, config.device.request_timeout())?;
        Ok(Self::with_transport(identity, Arc::new(transport), config))
    }

    pub fn with_transport(
        identity: AppIdentity,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Self {
        Self {
            identity,
            transport,
            local_url: config.device.local_url.trim_end_matches('/').to_string(),
            poll_interval: config.registration.poll_interval(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    /// Token that aborts polling when cancelled; dropping the registrar
    /// future has the same effect.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Unauthenticated `GET /api_version` against the local URL
    pub async fn discover(&self) -> Result<Discovery> {
        let url = join_url(&self.local_url, "api_version");
        let resp = self.transport.send(HttpRequest::get(url)).await.map_err(|e| {
            let err = Error::from(e);
            if matches!(err, Error::NetworkUnreachable(_)) {
                tracing::warn!(
                    local_url = %self.local_url,
                    "device unreachable, probably not connected to the Freebox network"
                );
            }
            err
        })?;

        let discovery: Discovery = protocol::payload(resp.status, resp.body)?;
        if discovery.https_available == Some(false) {
            return Err(Error::HttpsUnavailable);
        }

        tracing::debug!(
            api_version = %discovery.api_version,
            api_domain = ?discovery.api_domain,
            "discovered device"
        );
        Ok(discovery)
    }

    /// Versioned API root reached through the local URL
    pub fn api_root(&self, discovery: &Discovery) -> Result<String> {
        protocol::api_root(&self.local_url, &discovery.api_base_url, &discovery.api_version)
    }

    /// Unauthenticated `POST login/authorize` with this registrar's identity
    pub async fn request_authorization(&self, discovery: &Discovery) -> Result<PendingAuthorization> {
        let api_root = self.api_root(discovery)?;
        let body = serde_json::to_value(&self.identity)
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        let resp = self
            .transport
            .send(HttpRequest::post(join_url(&api_root, "login/authorize")).json(body))
            .await?;

        let grant: AuthorizationGrant = protocol::payload(resp.status, resp.body)?;
        let track_id = TrackId::try_from(&grant.track_id)?;

        tracing::debug!(%track_id, app_id = %self.identity.app_id(), "authorization requested");

        Ok(PendingAuthorization {
            app_token: grant.app_token,
            track_id,
            discovery: discovery.clone(),
            api_root,
        })
    }

    /// One `GET login/authorize/{track_id}`; the id is validated before any I/O.
    pub async fn track_authorization_progress<T>(
        &self,
        api_root: &str,
        track_id: T,
    ) -> Result<AuthorizationTrack>
    where
        T: TryInto<TrackId, Error = Error>,
    {
        let track_id = track_id.try_into()?;
        let url = join_url(api_root, &format!("login/authorize/{track_id}"));

        let resp = self.transport.send(HttpRequest::get(url)).await?;
        let mut track: AuthorizationTrack = protocol::payload(resp.status, resp.body)?;
        track.track_id = track_id.0;
        Ok(track)
    }

    /// Poll until the device reports a terminal status.
    ///
    /// Each tick waits for its round trip before the next one is scheduled;
    /// ticks missed meanwhile are skipped, never queued. There is no overall
    /// timeout: the device reports `timeout` itself.
    pub async fn poll_authorization(&self, pending: &PendingAuthorization) -> Result<AppRegistration> {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = ticker.tick() => {}
            }

            let track = self
                .until_cancelled(self.track_authorization_progress(&pending.api_root, &pending.track_id))
                .await?;

            tracing::debug!(track_id = %pending.track_id, status = %track.status, "authorization status");

            match track.status {
                AuthorizationStatus::Pending => continue,
                AuthorizationStatus::Granted => {
                    return Ok(AppRegistration {
                        app_token: pending.app_token.clone(),
                        app_id: self.identity.app_id().to_string(),
                        api_domain: pending.discovery.api_domain.clone(),
                        https_port: pending.discovery.https_port,
                        api_base_url: pending.discovery.api_base_url.clone(),
                        api_version: pending.discovery.api_version.clone(),
                        app_version: None,
                    });
                }
                status => return Err(Error::rejected(status)),
            }
        }
    }

    /// discover, request_authorization, then poll_authorization.
    ///
    /// `silent` only mutes the progress messages.
    ///
    /// Once the cancellation token fires, every call fails with `Cancelled`
    /// before sending anything.
    pub async fn register(&self, silent: bool) -> Result<AppRegistration> {
        let discovery = self.until_cancelled(self.discover()).await?;
        let pending = self.until_cancelled(self.request_authorization(&discovery)).await?;

        if !silent {
            tracing::info!(
                "Please check your Freebox Server LCD screen and authorize application access to register your app"
            );
        }

        let registration = self.poll_authorization(&pending).await?;

        if !silent {
            tracing::info!(
                app_id = %registration.app_id,
                "application access granted, store the returned credential safely"
            );
        }

        Ok(registration)
    }

    /// Run `step` unless cancelled first; a cancel mid-step drops it.
    async fn until_cancelled<T>(&self, step: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = step => result,
        }
    }
}
