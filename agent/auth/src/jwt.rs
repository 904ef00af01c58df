//! JWT verification handler.

use crate::headers::{self, Response};
use crate::token_source;
use http::header::AUTHORIZATION;
use http::request::Parts;
use http::HeaderValue;
use hub_agent_core::Predicate;
use hub_agent_k8s_api::access_control_policy::{JwtConfig, TokenSource};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct JwtHandler {
    keys: KeySource,
    source: TokenSource,
    predicate: Option<Predicate>,
    forward_headers: BTreeMap<String, String>,
    strip_authorization: bool,
}

enum KeySource {
    /// HMAC secret.
    Secret(Vec<u8>),
    /// PEM-encoded RSA/EC/Ed25519 public key.
    Pem(Vec<u8>),
    /// Inline or file-provided key set.
    Static(JwkSet),
    /// Remote key set with `Cache-Control: max-age` caching.
    Remote(RemoteJwks),
}

impl JwtHandler {
    pub fn new(cfg: &JwtConfig, http: reqwest::Client) -> anyhow::Result<Self> {
        let keys = if let Some(secret) = &cfg.signing_secret {
            let bytes = if cfg.signing_secret_base64_encoded {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.decode(secret.as_bytes())?
            } else {
                secret.as_bytes().to_vec()
            };
            KeySource::Secret(bytes)
        } else if let Some(pem) = &cfg.public_key {
            KeySource::Pem(pem.as_bytes().to_vec())
        } else if let Some(jwks) = &cfg.jwks_file {
            KeySource::Static(serde_json::from_str(jwks)?)
        } else if let Some(url) = &cfg.jwks_url {
            KeySource::Remote(RemoteJwks::new(url.clone(), http))
        } else {
            anyhow::bail!("jwt policy requires a signing secret, public key or JWKS source");
        };

        let predicate = cfg
            .claims
            .as_deref()
            .map(Predicate::parse)
            .transpose()?;

        Ok(Self {
            keys,
            source: cfg
                .token_source
                .clone()
                .unwrap_or_else(token_source::bearer_authorization),
            predicate,
            forward_headers: cfg.forward_headers.clone(),
            strip_authorization: cfg.strip_authorization_header,
        })
    }

    pub async fn serve(&self, parts: &Parts) -> Response {
        let Some(token) = token_source::extract(&self.source, parts) else {
            return headers::unauthorized();
        };

        let header = match decode_header(&token) {
            Ok(header) => header,
            Err(error) => {
                debug!(%error, "Malformed token header");
                return headers::unauthorized();
            }
        };

        let key = match self.resolve_key(&header).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(kid = ?header.kid, "No key matches the token");
                return headers::unauthorized();
            }
            Err(error) => {
                warn!(%error, "Failed to resolve verification key");
                return headers::internal_error();
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;

        let claims = match decode::<Value>(&token, &key, &validation) {
            Ok(data) => data.claims,
            Err(error) => {
                debug!(%error, "Token verification failed");
                return headers::unauthorized();
            }
        };

        if let Some(predicate) = &self.predicate {
            if !predicate.eval(&claims) {
                return headers::forbidden();
            }
        }

        let mut rsp = headers::status(http::StatusCode::OK);
        headers::forward_claims(&mut rsp, &self.forward_headers, &claims);
        if !self.strip_authorization {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                rsp.headers_mut().insert(AUTHORIZATION, value);
            }
        }
        rsp
    }

    async fn resolve_key(&self, header: &Header) -> anyhow::Result<Option<DecodingKey>> {
        match &self.keys {
            KeySource::Secret(secret) => Ok(Some(DecodingKey::from_secret(secret))),
            KeySource::Pem(pem) => Ok(Some(pem_key(pem, header.alg)?)),
            KeySource::Static(set) => Ok(find_jwk_key(set, header)?),
            KeySource::Remote(remote) => {
                let set = remote.get().await?;
                Ok(find_jwk_key(&set, header)?)
            }
        }
    }
}

fn pem_key(pem: &[u8], alg: Algorithm) -> anyhow::Result<DecodingKey> {
    let key = match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem)?,
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem)?,
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem)?,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            anyhow::bail!("HMAC tokens cannot be verified against a public key")
        }
    };
    Ok(key)
}

pub(crate) fn find_jwk_key(set: &JwkSet, header: &Header) -> anyhow::Result<Option<DecodingKey>> {
    let jwk = match &header.kid {
        Some(kid) => set.find(kid),
        // Without a key id, a single-key set is unambiguous.
        None if set.keys.len() == 1 => set.keys.first(),
        None => None,
    };
    match jwk {
        Some(jwk) => Ok(Some(DecodingKey::from_jwk(jwk)?)),
        None => Ok(None),
    }
}

/// A JWKS endpoint cached according to `Cache-Control: max-age`.
pub struct RemoteJwks {
    url: String,
    http: reqwest::Client,
    cache: Mutex<Option<(JwkSet, Instant)>>,
}

impl RemoteJwks {
    pub fn new(url: String, http: reqwest::Client) -> Self {
        Self {
            url,
            http,
            cache: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> anyhow::Result<JwkSet> {
        let mut cache = self.cache.lock().await;
        if let Some((set, fresh_until)) = cache.as_ref() {
            if Instant::now() < *fresh_until {
                return Ok(set.clone());
            }
        }

        let rsp = self.http.get(&self.url).send().await?.error_for_status()?;
        let max_age = rsp
            .headers()
            .get(http::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(Duration::ZERO);
        let set: JwkSet = rsp.json().await?;

        if !max_age.is_zero() {
            *cache = Some((set.clone(), Instant::now() + max_age));
        } else {
            *cache = None;
        }
        Ok(set)
    }
}

fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|seconds| seconds.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;
    use jsonwebtoken::{encode, EncodingKey};
    use serde_json::json;

    fn mk_parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/my-acp");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn sign(claims: &Value, secret: &str) -> String {
        encode(
            &jsonwebtoken::Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn mk_handler(cfg_extra: Value) -> JwtHandler {
        let mut cfg = json!({"signingSecret": "secret"});
        cfg.as_object_mut()
            .unwrap()
            .extend(cfg_extra.as_object().cloned().unwrap_or_default());
        let cfg: JwtConfig = serde_json::from_value(cfg).unwrap();
        JwtHandler::new(&cfg, reqwest::Client::new()).unwrap()
    }

    fn future_exp() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            + 3600
    }

    #[tokio::test]
    async fn valid_token_is_allowed() {
        let handler = mk_handler(json!({"forwardHeaders": {"X-Sub": "sub"}}));
        let token = sign(&json!({"sub": "alice", "exp": future_exp()}), "secret");
        let parts = mk_parts(&[("Authorization", &format!("Bearer {token}"))]);

        let rsp = handler.serve(&parts).await;
        assert_eq!(rsp.status(), http::StatusCode::OK);
        assert_eq!(rsp.headers()["X-Sub"], "alice");
        assert_eq!(
            rsp.headers()[AUTHORIZATION],
            format!("Bearer {token}").as_str()
        );
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let handler = mk_handler(json!({}));
        let rsp = handler.serve(&mk_parts(&[])).await;
        assert_eq!(rsp.status(), http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_signature_is_unauthorized() {
        let handler = mk_handler(json!({}));
        let token = sign(&json!({"sub": "alice", "exp": future_exp()}), "other");
        let parts = mk_parts(&[("Authorization", &format!("Bearer {token}"))]);
        assert_eq!(
            handler.serve(&parts).await.status(),
            http::StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn rejected_claims_are_forbidden() {
        let handler = mk_handler(json!({"claims": "Equals(`grp`, \"admin\")"}));
        let token = sign(&json!({"grp": "dev", "exp": future_exp()}), "secret");
        let parts = mk_parts(&[("Authorization", &format!("Bearer {token}"))]);
        assert_eq!(
            handler.serve(&parts).await.status(),
            http::StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn strip_authorization_header() {
        let handler = mk_handler(json!({"stripAuthorizationHeader": true}));
        let token = sign(&json!({"exp": future_exp()}), "secret");
        let parts = mk_parts(&[("Authorization", &format!("Bearer {token}"))]);
        let rsp = handler.serve(&parts).await;
        assert_eq!(rsp.status(), http::StatusCode::OK);
        assert!(rsp.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn handler_requires_a_key_source() {
        let cfg = JwtConfig::default();
        assert!(JwtHandler::new(&cfg, reqwest::Client::new()).is_err());
    }

    #[test]
    fn max_age_parsing() {
        assert_eq!(
            parse_max_age("public, max-age=300"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(parse_max_age("no-store"), None);
        assert_eq!(parse_max_age("max-age=oops"), None);
    }
}
