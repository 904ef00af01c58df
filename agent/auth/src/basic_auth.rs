//! HTTP Basic authentication against a bcrypt user table.

use crate::headers::{self, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::request::Parts;
use http::HeaderValue;
use hub_agent_k8s_api::access_control_policy::BasicAuthConfig;
use std::collections::HashMap;
use tracing::{debug, warn};

const DEFAULT_REALM: &str = "hub";

pub struct BasicAuthHandler {
    users: HashMap<String, String>,
    realm: String,
    strip_authorization: bool,
    forward_username: Option<String>,
}

impl BasicAuthHandler {
    pub fn new(cfg: &BasicAuthConfig) -> anyhow::Result<Self> {
        let mut users = HashMap::with_capacity(cfg.users.len());
        for entry in &cfg.users {
            let Some((user, hash)) = entry.split_once(':') else {
                anyhow::bail!("malformed user entry {entry:?}, expected user:hash");
            };
            users.insert(user.to_string(), hash.to_string());
        }
        if users.is_empty() {
            anyhow::bail!("basic auth policy requires at least one user");
        }

        Ok(Self {
            users,
            realm: cfg.realm.clone().unwrap_or_else(|| DEFAULT_REALM.to_string()),
            strip_authorization: cfg.strip_authorization_header,
            forward_username: cfg.forward_username_header.clone(),
        })
    }

    pub async fn serve(&self, parts: &Parts) -> Response {
        let Some(username) = self.authenticate(parts) else {
            return headers::unauthorized_basic(&self.realm);
        };

        let mut rsp = headers::status(http::StatusCode::OK);
        if let Some(header) = &self.forward_username {
            match (
                http::header::HeaderName::from_bytes(header.as_bytes()),
                HeaderValue::from_str(&username),
            ) {
                (Ok(name), Ok(value)) => {
                    rsp.headers_mut().insert(name, value);
                }
                _ => debug!(%header, "Skipping unrepresentable username header"),
            }
        }
        if self.strip_authorization {
            rsp.headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_static(""));
        }
        rsp
    }

    fn authenticate(&self, parts: &Parts) -> Option<String> {
        let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = STANDARD.decode(encoded).ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        let (user, password) = credentials.split_once(':')?;

        let hash = self.users.get(user)?;
        match bcrypt::verify(password, hash) {
            Ok(true) => Some(user.to_string()),
            Ok(false) => None,
            Err(error) => {
                warn!(%user, %error, "Stored password hash is invalid");
                None
            }
        }
    }
}
