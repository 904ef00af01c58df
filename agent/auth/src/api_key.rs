//! API-key authentication against a hashed key table.

use crate::headers::{self, Response};
use crate::token_source;
use http::request::Parts;
use http::HeaderValue;
use hub_agent_k8s_api::access_control_policy::{ApiKey, ApiKeyConfig, TokenSource};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub struct ApiKeyHandler {
    /// Keyed by the hex SHA-256 digest of the key value; comparing digests
    /// keeps the lookup timing independent of the presented key.
    keys: HashMap<String, ApiKey>,
    source: TokenSource,
    forward_headers: BTreeMap<String, String>,
}

impl ApiKeyHandler {
    pub fn new(cfg: &ApiKeyConfig) -> anyhow::Result<Self> {
        if cfg.keys.is_empty() {
            anyhow::bail!("api key policy requires at least one key");
        }
        let mut keys = HashMap::with_capacity(cfg.keys.len());
        for key in &cfg.keys {
            keys.insert(key.value.to_lowercase(), key.clone());
        }

        Ok(Self {
            keys,
            source: cfg.token_source.clone().unwrap_or(TokenSource {
                header: Some("X-Api-Key".to_string()),
                ..Default::default()
            }),
            forward_headers: cfg.forward_headers.clone(),
        })
    }

    pub async fn serve(&self, parts: &Parts) -> Response {
        let Some(presented) = token_source::extract(&self.source, parts) else {
            return headers::unauthorized();
        };

        let digest = hex_digest(&presented);
        let Some(key) = self.keys.get(&digest) else {
            debug!("Presented API key matches no configured key");
            return headers::unauthorized();
        };

        let mut rsp = headers::status(http::StatusCode::OK);
        for (header, field) in &self.forward_headers {
            let Some(value) = key.metadata.get(field) else {
                continue;
            };
            match (
                http::header::HeaderName::from_bytes(header.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    rsp.headers_mut().insert(name, value);
                }
                _ => debug!(%header, "Skipping unrepresentable metadata header"),
            }
        }
        rsp
    }
}

fn hex_digest(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
