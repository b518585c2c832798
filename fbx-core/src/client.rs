//! Authenticated Freebox client
//!
//! `Freebox` is the entry point for API calls. It attaches the current
//! session token to every request and, when the device answers that the
//! token expired, renews the session with the challenge carried by that
//! answer and replays the request once.
//!
//! A client is bound to the credential it was built from. Using another
//! app_token means building another client, so a cached session can never
//! outlive the credential that opened it.

use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{self, AppRegistration, Session};
use crate::session::{AUTH_HEADER, Credentials, SessionManager};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Transport, TransportError, join_url};

/// One original attempt plus one replay after renewal
const MAX_ATTEMPTS: usize = 2;

pub struct Freebox {
    api_root: String,
    transport: Arc<dyn Transport>,
    sessions: SessionManager,
    auto_login: bool,
}

impl Freebox {
    /// Client over HTTPS with the configured trust anchor
    pub fn new(registration: &AppRegistration, config: &Config) -> Result<Self> {
        let trust = config.device.trust.anchor()?;
        let transport = HttpTransport::new(&trust, config.device.request_timeout())?;
        Self::with_transport(registration, Arc::new(transport), config)
    }

    pub fn with_transport(
        registration: &AppRegistration,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Result<Self> {
        validate(registration)?;

        let origin = match registration.api_domain.as_deref() {
            Some(domain) => format!("https://{domain}"),
            None => config.device.local_url.trim_end_matches('/').to_string(),
        };
        let origin = match registration.https_port {
            Some(port) => format!("{origin}:{port}"),
            None => origin,
        };
        let api_root =
            protocol::api_root(&origin, &registration.api_base_url, &registration.api_version)?;

        let credentials = Credentials {
            app_id: registration.app_id.clone(),
            app_token: registration.app_token.clone(),
            app_version: registration.app_version.clone(),
        };

        Ok(Self {
            sessions: SessionManager::new(transport.clone(), api_root.clone(), credentials),
            api_root,
            transport,
            auto_login: config.session.auto_login,
        })
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn session(&self) -> Option<Session> {
        self.sessions.current().await
    }

    /// Open a session now, fetching a fresh challenge.
    ///
    /// Without `auto_login`, a client with no session gets the device's 403
    /// back on its first call, so call this before the first request.
    pub async fn login(&self) -> Result<Session> {
        self.sessions.login(None).await
    }

    /// Close the session on the device and forget it locally.
    pub async fn logout(&self) -> Result<bool> {
        let result = self.sessions.logout().await;
        self.sessions.clear().await;
        result
    }

    /// Authenticated call to a path under the API root.
    ///
    /// Absolute URLs are accepted only when they point under the API root, so
    /// the session token never leaves the device.
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = self.resolve(&request.url)?;

        if self.auto_login && self.sessions.current().await.is_none() {
            self.sessions.ensure().await?;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let token = self.sessions.session_token().await;

            let failure = match self.transport.send(self.prepare(&request, &url, token.as_deref())).await {
                Ok(resp) => return Ok(resp),
                Err(failure) => failure,
            };

            if attempts >= MAX_ATTEMPTS {
                return Err(failure.into());
            }

            let Some(challenge) = expired_session_challenge(&failure, token.as_deref()) else {
                return Err(failure.into());
            };

            tracing::debug!(url = %request.url, "session token expired, renewing");
            self.sessions.renew(token.as_deref(), &challenge).await?;
        }
    }

    fn resolve(&self, path: &str) -> Result<String> {
        let url = join_url(&self.api_root, path);
        let under_root = url
            .strip_prefix(self.api_root.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'));
        if !under_root {
            return Err(Error::Validation(vec![format!(
                "{url} is outside the API root {}",
                self.api_root
            )]));
        }
        Ok(url)
    }

    fn prepare(&self, request: &HttpRequest, url: &str, token: Option<&str>) -> HttpRequest {
        let mut prepared = request.clone();
        prepared.url = url.to_string();
        prepared
            .headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case(AUTH_HEADER));
        if let Some(token) = token {
            prepared.headers.push((AUTH_HEADER.to_string(), token.to_string()));
        }
        prepared
    }
}

/// Challenge of a 403 `auth_required` answer to a request that carried a session.
fn expired_session_challenge(failure: &TransportError, sent_token: Option<&str>) -> Option<String> {
    let TransportError::Http { status: 403, body } = failure else {
        return None;
    };
    if sent_token.is_none() {
        return None;
    }

    if body.get("error_code").and_then(Value::as_str) != Some("auth_required") {
        return None;
    }

    body.get("result")
        .and_then(|r| r.get("challenge"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn validate(registration: &AppRegistration) -> Result<()> {
    let mut errors = Vec::new();

    if registration.app_token.is_empty() {
        errors.push("app_token is required and must be a non-empty string".to_string());
    }
    if registration.app_id.is_empty() {
        errors.push("app_id is required and must be a non-empty string".to_string());
    }
    if registration.api_base_url.is_empty() {
        errors.push("api_base_url is required and must be a non-empty string".to_string());
    }
    if registration.api_version.is_empty() {
        errors.push("api_version is required and must be a non-empty string".to_string());
    } else if protocol::major_version(&registration.api_version).is_none() {
        errors.push(format!(
            "api_version \"{}\" has no integer major version",
            registration.api_version
        ));
    }
    if registration.api_domain.as_deref() == Some("") {
        errors.push("api_domain must be a non-empty string".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::transport::mock::{MockTransport, fail, ok};

    const ROOT: &str = "https://r42bhm9p.fbxos.fr:35023/api/v7";

    fn registration() -> AppRegistration {
        AppRegistration {
            app_token: "app-token-123".to_string(),
            app_id: "fbx.integration.test".to_string(),
            api_domain: Some("r42bhm9p.fbxos.fr".to_string()),
            https_port: Some(35023),
            api_base_url: "/api/".to_string(),
            api_version: "7.1".to_string(),
            app_version: None,
        }
    }

    fn expired() -> std::result::Result<HttpResponse, TransportError> {
        fail(
            403,
            json!({ "success": false, "error_code": "auth_required", "result": { "challenge": "renew-me" } }),
        )
    }

    /// Issues `session-N` on the Nth login. `wifi/config` accepts only
    /// `accepted` and answers everything else as expired.
    fn device(accepted: &'static str) -> Arc<MockTransport> {
        let sessions = AtomicUsize::new(0);
        Arc::new(MockTransport::new(move |req| {
            if req.url == format!("{ROOT}/login") {
                ok(json!({ "success": true, "result": { "challenge": "fresh", "logged_in": false } }))
            } else if req.url == format!("{ROOT}/login/session") {
                let n = sessions.fetch_add(1, Ordering::SeqCst) + 1;
                ok(json!({
                    "success": true,
                    "result": { "session_token": format!("session-{n}"), "permissions": { "settings": true } }
                }))
            } else if req.url == format!("{ROOT}/wifi/config") {
                if req.header_value(AUTH_HEADER) == Some(accepted) {
                    ok(json!({ "success": true, "result": { "wifi_state": "on" } }))
                } else {
                    expired()
                }
            } else if req.url == format!("{ROOT}/login/logout") {
                ok(json!({ "success": true }))
            } else {
                panic!("unexpected request to {}", req.url)
            }
        }))
    }

    fn client(transport: Arc<MockTransport>, config: &Config) -> Freebox {
        Freebox::with_transport(&registration(), transport, config).unwrap()
    }

    async fn logged_in(transport: Arc<MockTransport>) -> Freebox {
        let freebox = client(transport, &Config::default());
        freebox.sessions().login(Some("initial")).await.unwrap();
        freebox
    }

    #[tokio::test]
    async fn test_expired_session_renews_and_retries_once() {
        let transport = device("session-2");
        let freebox = logged_in(transport.clone()).await;

        let resp = freebox.request(HttpRequest::get("wifi/config")).await.unwrap();
        assert_eq!(resp.body["result"]["wifi_state"], "on");

        let calls: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.url.ends_with("/wifi/config"))
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].header_value(AUTH_HEADER), Some("session-1"));
        assert_eq!(calls[1].header_value(AUTH_HEADER), Some("session-2"));

        // initial login + exactly one renewal, renewal reuses the 403 challenge
        assert_eq!(transport.calls_to("/login/session"), 2);
        assert_eq!(transport.calls_to("/login"), 0);
        let renewal = transport
            .requests()
            .into_iter()
            .filter(|r| r.url.ends_with("/login/session"))
            .nth(1)
            .unwrap();
        assert_eq!(
            renewal.body.unwrap()["password"],
            crate::session::derive_password("app-token-123", "renew-me")
        );
    }

    #[tokio::test]
    async fn test_second_expiry_is_surfaced() {
        let transport = device("never");
        let freebox = logged_in(transport.clone()).await;

        let err = freebox.request(HttpRequest::get("wifi/config")).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 403, .. }));
        assert_eq!(err.error_code(), Some("auth_required"));

        assert_eq!(transport.calls_to("/wifi/config"), 2);
        assert_eq!(transport.calls_to("/login/session"), 2);
    }

    #[tokio::test]
    async fn test_fresh_client_without_session_is_not_renewed() {
        let transport = device("session-1");
        let freebox = client(transport.clone(), &Config::default());

        let err = freebox.request(HttpRequest::get("wifi/config")).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 403, .. }));
        assert_eq!(transport.calls_to("/wifi/config"), 1);
        assert_eq!(transport.calls_to("/login/session"), 0);
        assert!(transport.requests()[0].header_value(AUTH_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_auto_login_opens_session_before_first_request() {
        let transport = device("session-1");
        let mut config = Config::default();
        config.session.auto_login = true;
        let freebox = client(transport.clone(), &config);

        let resp = freebox.request(HttpRequest::get("wifi/config")).await.unwrap();
        assert_eq!(resp.status, 200);

        let urls: Vec<_> = transport.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(
            urls,
            vec![
                format!("{ROOT}/login"),
                format!("{ROOT}/login/session"),
                format!("{ROOT}/wifi/config"),
            ]
        );
    }

    #[tokio::test]
    async fn test_auth_required_without_challenge_is_surfaced() {
        let transport = Arc::new(MockTransport::new(|req| {
            if req.url.ends_with("/login/session") {
                ok(json!({ "success": true, "result": { "session_token": "s" } }))
            } else {
                fail(403, json!({ "success": false, "error_code": "auth_required" }))
            }
        }));
        let freebox = logged_in(transport.clone()).await;

        assert!(freebox.request(HttpRequest::get("wifi/config")).await.is_err());
        assert_eq!(transport.calls_to("/wifi/config"), 1);
        assert_eq!(transport.calls_to("/login/session"), 1);
    }

    #[tokio::test]
    async fn test_other_failures_are_not_retried() {
        let transport = Arc::new(MockTransport::new(|req| {
            if req.url.ends_with("/login/session") {
                ok(json!({ "success": true, "result": { "session_token": "s" } }))
            } else if req.url.ends_with("/lan/browser") {
                fail(403, json!({ "success": false, "error_code": "insufficient_rights", "result": { "challenge": "x" } }))
            } else {
                Err(TransportError::Network("timed out".to_string()))
            }
        }));
        let freebox = logged_in(transport.clone()).await;

        let err = freebox.request(HttpRequest::get("lan/browser")).await.unwrap_err();
        assert_eq!(err.error_code(), Some("insufficient_rights"));
        let err = freebox.request(HttpRequest::get("wifi/config")).await.unwrap_err();
        assert!(matches!(err, Error::NetworkUnreachable(_)));

        assert_eq!(transport.calls_to("/lan/browser"), 1);
        assert_eq!(transport.calls_to("/wifi/config"), 1);
        assert_eq!(transport.calls_to("/login/session"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_expiry_renews_once() {
        let transport = device("session-2");
        let freebox = logged_in(transport.clone()).await;

        let (a, b) = tokio::join!(
            freebox.request(HttpRequest::get("wifi/config")),
            freebox.request(HttpRequest::get("wifi/config")),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());

        assert_eq!(transport.calls_to("/login/session"), 2);
        assert_eq!(transport.calls_to("/wifi/config"), 4);
        assert_eq!(
            freebox.session().await.map(|s| s.session_token).as_deref(),
            Some("session-2")
        );
    }

    #[tokio::test]
    async fn test_caller_auth_header_is_replaced() {
        let transport = device("session-1");
        let freebox = logged_in(transport.clone()).await;

        freebox
            .request(HttpRequest::get("wifi/config").header("x-fbx-app-auth", "forged"))
            .await
            .unwrap();

        let call = transport.requests().pop().unwrap();
        assert_eq!(call.headers.len(), 1);
        assert_eq!(call.header_value(AUTH_HEADER), Some("session-1"));
    }

    #[tokio::test]
    async fn test_foreign_absolute_url_is_refused() {
        let transport = device("session-1");
        let freebox = logged_in(transport.clone()).await;
        let sent = transport.requests().len();

        for url in ["https://attacker.example/wifi/config", "https://r42bhm9p.fbxos.fr:35023/api/v70/x"] {
            let err = freebox.request(HttpRequest::get(url)).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        assert_eq!(transport.requests().len(), sent);

        freebox
            .request(HttpRequest::get(format!("{ROOT}/wifi/config")))
            .await
            .unwrap();
        assert_eq!(transport.calls_to("/wifi/config"), 1);
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let transport = device("session-1");
        let freebox = logged_in(transport.clone()).await;

        assert!(freebox.logout().await.unwrap());
        assert!(freebox.session().await.is_none());
        assert_eq!(
            transport.requests().pop().unwrap().header_value(AUTH_HEADER),
            Some("session-1")
        );
    }

    #[test]
    fn test_validation_collects_every_error() {
        let transport = device("session-1");
        let registration = AppRegistration {
            app_token: String::new(),
            app_id: String::new(),
            api_domain: Some(String::new()),
            https_port: None,
            api_base_url: String::new(),
            api_version: String::new(),
            app_version: None,
        };

        let err = Freebox::with_transport(&registration, transport.clone(), &Config::default())
            .err()
            .unwrap();
        match err {
            Error::Validation(errors) => assert_eq!(errors.len(), 5),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_api_root() {
        let freebox = client(device("x"), &Config::default());
        assert_eq!(freebox.api_root(), ROOT);

        let mut local = registration();
        local.api_domain = None;
        local.https_port = None;
        local.api_version = "6.0".to_string();
        let freebox = Freebox::with_transport(&local, device("x"), &Config::default()).unwrap();
        assert_eq!(freebox.api_root(), "https://mafreebox.freebox.fr/api/v6");

        let mut bad = registration();
        bad.api_version = "v7".to_string();
        assert!(matches!(
            Freebox::with_transport(&bad, device("x"), &Config::default()),
            Err(Error::Validation(_))
        ));
    }
}
