//! OpenID Connect authorization-code flow handler.
//!
//! Per request this walks a small state machine: logout, provider
//! callback, existing session (verify, maybe refresh), or no session
//! (redirect safe methods to the provider, reject writes). Session state
//! lives entirely in encrypted cookies; the provider is discovered lazily
//! and its keys are cached by the JWKS layer.

use crate::headers::{self, Response};
use crate::jwt::{find_jwk_key, RemoteJwks};
use crate::session::{
    parse_same_site, CookieAttributes, SessionData, SessionStore, StateData, StateStore,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::request::Parts;
use http::{HeaderValue, Method, StatusCode};
use hub_agent_core::{forwarded_method, forwarded_url, is_safe_method, Predicate};
use hub_agent_k8s_api::access_control_policy::{OidcConfig, OidcGoogleConfig};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

const GOOGLE_ISSUER: &str = "https://accounts.google.com";

/// Marks requests arriving through NGINX's auth-request mode, which cannot
/// follow redirects.
const NGINX_MARKER_HEADER: &str = "from";

pub struct OidcHandler {
    issuer: String,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    logout_url: Option<String>,
    scopes: Vec<String>,
    auth_params: BTreeMap<String, String>,
    session: SessionStore,
    refresh: bool,
    state: StateStore,
    predicate: Option<Predicate>,
    forward_headers: BTreeMap<String, String>,
    allowed_emails: Option<Vec<String>>,
    http: reqwest::Client,
    discovery: OnceCell<Discovery>,
    jwks: OnceCell<RemoteJwks>,
}

#[derive(Clone, Debug, Deserialize)]
struct Discovery {
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl OidcHandler {
    pub fn from_oidc(policy: &str, cfg: &OidcConfig, http: reqwest::Client) -> anyhow::Result<Self> {
        let session_cfg = cfg
            .session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("oidc policy requires session configuration"))?;

        let session_attrs = CookieAttributes {
            path: session_cfg.path.clone().unwrap_or_else(|| "/".to_string()),
            domain: session_cfg.domain.clone(),
            secure: session_cfg.secure,
            same_site: parse_same_site(session_cfg.same_site.as_deref()),
            max_age: None,
        };
        let state_attrs = cfg
            .state_cookie
            .as_ref()
            .map(|state| CookieAttributes {
                path: state.path.clone().unwrap_or_else(|| "/".to_string()),
                domain: state.domain.clone(),
                secure: state.secure,
                same_site: parse_same_site(state.same_site.as_deref()),
                max_age: None,
            })
            .unwrap_or_default();

        let mut scopes = cfg.scopes.clone();
        if !scopes.iter().any(|s| s == "openid") {
            scopes.insert(0, "openid".to_string());
        }

        let predicate = cfg.claims.as_deref().map(Predicate::parse).transpose()?;

        Ok(Self {
            issuer: cfg.issuer.clone(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            redirect_url: cfg.redirect_url.clone(),
            logout_url: cfg.logout_url.clone(),
            scopes,
            auth_params: cfg.auth_params.clone(),
            session: SessionStore::new(policy, &session_cfg.secret, session_attrs),
            refresh: session_cfg.refresh.unwrap_or(false),
            state: StateStore::new(policy, &session_cfg.secret, state_attrs),
            predicate,
            forward_headers: cfg.forward_headers.clone(),
            allowed_emails: None,
            http,
            discovery: OnceCell::new(),
            jwks: OnceCell::new(),
        })
    }

    pub fn from_google(
        policy: &str,
        cfg: &OidcGoogleConfig,
        http: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let oidc = OidcConfig {
            issuer: GOOGLE_ISSUER.to_string(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            redirect_url: cfg.redirect_url.clone(),
            logout_url: cfg.logout_url.clone(),
            scopes: vec!["openid".to_string(), "email".to_string()],
            auth_params: cfg.auth_params.clone(),
            state_cookie: cfg.state_cookie.clone(),
            session: cfg.session.clone(),
            claims: None,
            forward_headers: cfg.forward_headers.clone(),
        };
        let mut handler = Self::from_oidc(policy, &oidc, http)?;
        handler.allowed_emails = Some(cfg.emails.clone());
        Ok(handler)
    }

    pub async fn serve(&self, parts: &Parts) -> Response {
        let headers = &parts.headers;
        let forwarded = match forwarded_url(headers) {
            Ok(url) => url,
            Err(error) => {
                warn!(%error, "Cannot reconstruct forwarded request");
                return headers::internal_error();
            }
        };
        let method = forwarded_method(headers, &parts.method);
        let nginx_mode = headers
            .get(NGINX_MARKER_HEADER)
            .map(|v| v.as_bytes() == b"nginx")
            .unwrap_or(false);

        if method == Method::DELETE {
            if let Some(logout) = &self.logout_url {
                if same_resource(&forwarded, &self.resolve(logout, &forwarded)) {
                    let mut rsp = headers::status(StatusCode::NO_CONTENT);
                    headers::set_cookies(&mut rsp, &self.session.removal_cookies(headers));
                    return rsp;
                }
            }
        }

        let redirect_url = self.resolve(&self.redirect_url, &forwarded);

        let session = self.session.load(headers).unwrap_or_else(|error| {
            debug!(%error, "Discarding unreadable session cookie");
            None
        });

        let Some(session) = session else {
            if same_resource(&forwarded, &redirect_url) {
                return self.callback(parts, &forwarded, &redirect_url).await;
            }
            if !is_safe_method(&method) {
                return headers::unauthorized();
            }
            if forwarded.path().ends_with("/favicon.ico") {
                return headers::unauthorized();
            }
            return self.login_redirect(&forwarded, &redirect_url, nginx_mode).await;
        };

        if session.is_expired(unix_now()) {
            if self.refresh && session.refresh_token.is_some() {
                return self
                    .refresh_session(parts, session, &forwarded, &redirect_url, nginx_mode)
                    .await;
            }
            if self.refresh {
                // Refresh is on but we never got a refresh token; start over.
                let mut rsp = if is_safe_method(&method) {
                    self.login_redirect(&forwarded, &redirect_url, nginx_mode).await
                } else {
                    headers::unauthorized()
                };
                headers::set_cookies(&mut rsp, &self.session.removal_cookies(headers));
                return rsp;
            }
            // Refresh disabled: the session cookie is the lifetime authority.
        }

        self.allow(parts, &session, &[]).await
    }

    /// Resolves a configured URL against the forwarded request: absolute
    /// URLs pass through, paths adopt the forwarded scheme and host.
    fn resolve(&self, configured: &str, forwarded: &Url) -> Url {
        if configured.starts_with("http://") || configured.starts_with("https://") {
            if let Ok(url) = Url::parse(configured) {
                return url;
            }
        }
        let mut url = forwarded.clone();
        url.set_query(None);
        url.set_fragment(None);
        let path = if configured.starts_with('/') {
            configured.to_string()
        } else {
            format!("/{configured}")
        };
        url.set_path(&path);
        url
    }

    async fn login_redirect(&self, forwarded: &Url, redirect_url: &Url, nginx_mode: bool) -> Response {
        let discovery = match self.discovery().await {
            Ok(discovery) => discovery,
            Err(error) => {
                warn!(%error, "Provider discovery failed");
                return headers::internal_error();
            }
        };

        let verifier = random_token(64);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        let state = StateData {
            redirect_id: random_token(20),
            nonce: random_token(20),
            origin_url: forwarded.to_string(),
            code_verifier: Some(verifier),
        };
        let state_cookie = match self.state.cookie_for(&state) {
            Ok(cookie) => cookie,
            Err(error) => {
                warn!(%error, "Failed to seal state cookie");
                return headers::internal_error();
            }
        };

        let mut authorize = match Url::parse(&discovery.authorization_endpoint) {
            Ok(url) => url,
            Err(error) => {
                warn!(%error, "Provider advertises an invalid authorization endpoint");
                return headers::internal_error();
            }
        };
        {
            let mut query = authorize.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.scopes.join(" "))
                .append_pair("redirect_uri", redirect_url.as_str())
                .append_pair("state", &state.redirect_id)
                .append_pair("nonce", &state.nonce)
                .append_pair("code_challenge", &challenge)
                .append_pair("code_challenge_method", "S256");
            for (key, value) in &self.auth_params {
                query.append_pair(key, value);
            }
            if self.refresh {
                query
                    .append_pair("access_type", "offline")
                    .append_pair("prompt", "consent");
            }
        }

        let mut rsp = if nginx_mode {
            headers::nginx_redirect(authorize.as_str())
        } else {
            headers::redirect(authorize.as_str())
        };
        headers::set_cookies(&mut rsp, &[state_cookie]);
        rsp
    }

    async fn callback(&self, parts: &Parts, forwarded: &Url, redirect_url: &Url) -> Response {
        let state = match self.state.load(&parts.headers) {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!("Provider callback without a state cookie");
                return headers::bad_request();
            }
            Err(error) => {
                debug!(%error, "Provider callback with an unreadable state cookie");
                return headers::bad_request();
            }
        };

        let mut state_param = None;
        let mut code = None;
        for (key, value) in forwarded.query_pairs() {
            match key.as_ref() {
                "state" => state_param = Some(value.into_owned()),
                "code" => code = Some(value.into_owned()),
                _ => {}
            }
        }
        if state_param.as_deref() != Some(state.redirect_id.as_str()) {
            debug!("State parameter missing or mismatched");
            return headers::bad_request();
        }
        let Some(code) = code else {
            return headers::bad_request();
        };

        let discovery = match self.discovery().await {
            Ok(discovery) => discovery,
            Err(error) => {
                warn!(%error, "Provider discovery failed");
                return headers::internal_error();
            }
        };

        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code),
            ("redirect_uri".to_string(), redirect_url.to_string()),
        ];
        if let Some(verifier) = &state.code_verifier {
            form.push(("code_verifier".to_string(), verifier.clone()));
        }

        let tokens = match self.token_request(&discovery.token_endpoint, &form).await {
            Ok(tokens) => tokens,
            Err(error) => {
                warn!(%error, "Code exchange failed");
                return headers::unauthorized();
            }
        };
        let Some(id_token) = tokens.id_token.clone() else {
            warn!("Provider response is missing an ID token");
            return headers::unauthorized();
        };

        let claims = match self.verify_id_token(&id_token, Some(&state.nonce)).await {
            Ok(claims) => claims,
            Err(error) => {
                warn!(%error, "ID token verification failed");
                return headers::unauthorized();
            }
        };
        if let Some(rsp) = self.check_email(&claims) {
            return rsp;
        }

        let session = mk_session(&tokens, id_token);
        let cookies = match self.session.cookies_for(&session) {
            Ok(cookies) => cookies,
            Err(error) => {
                warn!(%error, "Failed to seal session cookie");
                return headers::internal_error();
            }
        };

        let mut rsp = headers::redirect(&state.origin_url);
        headers::set_cookies(&mut rsp, &cookies);
        headers::set_cookies(&mut rsp, &[self.state.removal_cookie()]);
        rsp
    }

    async fn refresh_session(
        &self,
        parts: &Parts,
        session: SessionData,
        forwarded: &Url,
        redirect_url: &Url,
        nginx_mode: bool,
    ) -> Response {
        let discovery = match self.discovery().await {
            Ok(discovery) => discovery,
            Err(error) => {
                warn!(%error, "Provider discovery failed");
                return headers::internal_error();
            }
        };

        let refresh_token = session.refresh_token.clone().unwrap_or_default();
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.clone()),
        ];
        let tokens = match self.token_request(&discovery.token_endpoint, &form).await {
            Ok(tokens) => tokens,
            Err(error) => {
                debug!(%error, "Session refresh failed, forcing a new login");
                let method = forwarded_method(&parts.headers, &parts.method);
                let mut rsp = if is_safe_method(&method) {
                    self.login_redirect(forwarded, redirect_url, nginx_mode).await
                } else {
                    headers::unauthorized()
                };
                headers::set_cookies(&mut rsp, &self.session.removal_cookies(&parts.headers));
                return rsp;
            }
        };

        // Providers may omit the ID token on refresh; keep the previous one.
        let id_token = tokens.id_token.clone().unwrap_or(session.id_token);
        if let Err(error) = self.verify_id_token(&id_token, None).await {
            warn!(%error, "Refreshed ID token verification failed");
            return headers::unauthorized();
        }

        let mut refreshed = mk_session(&tokens, id_token);
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        let cookies = match self.session.cookies_for(&refreshed) {
            Ok(cookies) => cookies,
            Err(error) => {
                warn!(%error, "Failed to seal refreshed session cookie");
                return headers::internal_error();
            }
        };

        let method = forwarded_method(&parts.headers, &parts.method);
        if is_safe_method(&method) && !nginx_mode {
            // Redirect so the next request carries the refreshed cookie.
            let mut rsp = headers::redirect(forwarded.as_str());
            headers::set_cookies(&mut rsp, &cookies);
            return rsp;
        }
        self.allow(parts, &refreshed, &cookies).await
    }

    async fn allow(&self, parts: &Parts, session: &SessionData, cookies: &[String]) -> Response {
        let claims = match self.verify_id_token(&session.id_token, None).await {
            Ok(claims) => claims,
            Err(error) => {
                debug!(%error, "Session ID token verification failed");
                return headers::unauthorized();
            }
        };
        if let Some(rsp) = self.check_email(&claims) {
            return rsp;
        }
        if let Some(predicate) = &self.predicate {
            if !predicate.eval(&claims) {
                return headers::forbidden();
            }
        }

        let mut rsp = headers::status(StatusCode::OK);
        headers::forward_claims(&mut rsp, &self.forward_headers, &claims);
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", session.access_token)) {
            rsp.headers_mut().insert(AUTHORIZATION, value);
        }
        // Upstream never sees our session cookie.
        let remaining = self
            .session
            .strip_cookie_header(&parts.headers)
            .unwrap_or_default();
        if let Ok(value) = HeaderValue::from_str(&remaining) {
            rsp.headers_mut().insert(http::header::COOKIE, value);
        }
        headers::set_cookies(&mut rsp, cookies);
        rsp
    }

    fn check_email(&self, claims: &Value) -> Option<Response> {
        let allowed = self.allowed_emails.as_ref()?;
        if allowed.is_empty() {
            return None;
        }
        let email = claims.get("email").and_then(Value::as_str).unwrap_or_default();
        if allowed.iter().any(|candidate| candidate == email) {
            None
        } else {
            Some(headers::forbidden())
        }
    }

    async fn token_request(
        &self,
        endpoint: &str,
        form: &[(String, String)],
    ) -> anyhow::Result<TokenResponse> {
        let rsp = self
            .http
            .post(endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await?;
        if !rsp.status().is_success() {
            anyhow::bail!("provider rejected the token request with {}", rsp.status());
        }
        Ok(rsp.json().await?)
    }

    async fn verify_id_token(
        &self,
        raw: &str,
        expected_nonce: Option<&str>,
    ) -> anyhow::Result<Value> {
        let header = jsonwebtoken::decode_header(raw)?;
        let set = self.jwks().await?.get().await?;
        let key = find_jwk_key(&set, &header)?
            .ok_or_else(|| anyhow::anyhow!("no provider key matches the ID token"))?;

        let mut validation = jsonwebtoken::Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        // The session cookie, not the ID token, bounds the session lifetime.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let claims = jsonwebtoken::decode::<Value>(raw, &key, &validation)?.claims;

        if let Some(expected) = expected_nonce {
            let nonce = claims.get("nonce").and_then(Value::as_str);
            anyhow::ensure!(nonce == Some(expected), "nonce mismatch");
        }
        Ok(claims)
    }

    async fn discovery(&self) -> anyhow::Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                let url = format!(
                    "{}/.well-known/openid-configuration",
                    self.issuer.trim_end_matches('/')
                );
                let rsp = self.http.get(url).send().await?.error_for_status()?;
                Ok(rsp.json().await?)
            })
            .await
    }

    async fn jwks(&self) -> anyhow::Result<&RemoteJwks> {
        self.jwks
            .get_or_try_init(|| async {
                let discovery = self.discovery().await?;
                Ok(RemoteJwks::new(discovery.jwks_uri.clone(), self.http.clone()))
            })
            .await
    }
}

fn mk_session(tokens: &TokenResponse, id_token: String) -> SessionData {
    let token_type = if tokens.token_type.is_empty() {
        "Bearer".to_string()
    } else {
        tokens.token_type.clone()
    };
    SessionData {
        access_token: tokens.access_token.clone(),
        token_type,
        refresh_token: tokens.refresh_token.clone(),
        id_token,
        expiry: unix_now() + tokens.expires_in.unwrap_or(3600) as i64,
    }
}

/// Scheme/host/path equality, ignoring query and fragment.
fn same_resource(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
        && a.path() == b.path()
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
