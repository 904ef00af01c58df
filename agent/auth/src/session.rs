//! Encrypted cookie storage for OIDC sessions and login state.
//!
//! Session payloads are AEAD-encrypted, base64-URL encoded and carried as
//! one or many chunked cookies named `<policy>-session[-N]`. The chunking
//! algorithm is load-bearing: the decoder reads the base name first and
//! otherwise concatenates `<name>-1`, `<name>-2`, … until a number is
//! missing.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cookie::{Cookie, SameSite};
use http::header::{HeaderMap, COOKIE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Cookies larger than this are split into numbered chunks.
pub const MAX_COOKIE_SIZE: usize = 4000;

/// Reassembly stops after this many chunks.
pub const MAX_CHUNKS: usize = 180;

const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to encrypt cookie payload")]
    Encrypt,

    #[error("failed to decrypt cookie payload")]
    Decrypt,

    #[error("malformed cookie payload: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("malformed cookie payload: {0}")]
    Serde(#[from] serde_json::Error),
}

/// An OIDC session as carried in the session cookie.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub id_token: String,
    /// Expiry instant, unix seconds.
    pub expiry: i64,
}

impl SessionData {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry <= now
    }
}

/// Login state pinned between the authorize redirect and the callback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateData {
    pub redirect_id: String,
    pub nonce: String,
    pub origin_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

/// AES-256-GCM over a key derived from the policy secret.
pub struct Cipher {
    aead: Aes256Gcm,
}

impl Cipher {
    pub fn new(secret: &str) -> Self {
        let key_bytes = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            aead: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| SessionError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SessionError> {
        if data.len() < NONCE_SIZE {
            return Err(SessionError::Decrypt);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SessionError::Decrypt)
    }
}

/// Splits an encoded value into cookies honouring the size limit.
///
/// A value fitting in one cookie keeps the bare name; larger values become
/// `<name>-1`, `<name>-2`, … with each chunk sized so the whole cookie
/// stays under the limit.
pub fn chunk_value(name: &str, value: &str, max_size: usize) -> Vec<(String, String)> {
    if name.len() + value.len() <= max_size {
        return vec![(name.to_string(), value.to_string())];
    }

    let chunk_size = max_size.saturating_sub(name.len() + 3).max(1);
    value
        .as_bytes()
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| {
            let chunk = std::str::from_utf8(chunk).expect("base64 chunks are ASCII");
            (format!("{name}-{}", i + 1), chunk.to_string())
        })
        .collect()
}

/// Reassembles a chunked value from request cookies.
pub fn assemble_value(cookies: &[(String, String)], name: &str) -> Option<String> {
    let get = |wanted: &str| {
        cookies
            .iter()
            .find(|(n, _)| n == wanted)
            .map(|(_, v)| v.clone())
    };

    if let Some(value) = get(name) {
        return Some(value);
    }

    let mut out = String::new();
    for i in 1..=MAX_CHUNKS {
        match get(&format!("{name}-{i}")) {
            Some(chunk) => out.push_str(&chunk),
            None => break,
        }
    }
    (!out.is_empty()).then_some(out)
}

/// Parses all `Cookie` headers into name/value pairs.
pub fn request_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| Cookie::split_parse(header.to_string()))
        .filter_map(|parsed| parsed.ok())
        .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
        .collect()
}

/// Cookie attributes shared by the session and state stores.
#[derive(Clone, Debug)]
pub struct CookieAttributes {
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub same_site: SameSite,
    pub max_age: Option<i64>,
}

impl Default for CookieAttributes {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: None,
            secure: false,
            same_site: SameSite::Lax,
            max_age: None,
        }
    }
}

pub fn parse_same_site(value: Option<&str>) -> SameSite {
    match value {
        Some(v) if v.eq_ignore_ascii_case("strict") => SameSite::Strict,
        Some(v) if v.eq_ignore_ascii_case("none") => SameSite::None,
        _ => SameSite::Lax,
    }
}

/// Reads and writes the chunked session cookie for one policy.
pub struct SessionStore {
    cipher: Cipher,
    name: String,
    attributes: CookieAttributes,
    max_size: usize,
}

impl SessionStore {
    pub fn new(policy: &str, secret: &str, attributes: CookieAttributes) -> Self {
        Self {
            cipher: Cipher::new(secret),
            name: format!("{policy}-session"),
            attributes,
            max_size: MAX_COOKIE_SIZE,
        }
    }

    #[cfg(test)]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encrypts a session into one or more `Set-Cookie` values.
    pub fn cookies_for(&self, session: &SessionData) -> Result<Vec<String>, SessionError> {
        let plaintext = serde_json::to_vec(session)?;
        let value = URL_SAFE_NO_PAD.encode(self.cipher.encrypt(&plaintext)?);

        Ok(chunk_value(&self.name, &value, self.max_size)
            .into_iter()
            .map(|(name, value)| self.build_cookie(&name, &value, self.attributes.max_age))
            .collect())
    }

    /// Loads the session from request cookies, reassembling chunks.
    pub fn load(&self, headers: &HeaderMap) -> Result<Option<SessionData>, SessionError> {
        let cookies = request_cookies(headers);
        let Some(value) = assemble_value(&cookies, &self.name) else {
            return Ok(None);
        };
        let data = self.cipher.decrypt(&URL_SAFE_NO_PAD.decode(value.as_bytes())?)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// `Set-Cookie` values expiring every session cookie on the request.
    pub fn removal_cookies(&self, headers: &HeaderMap) -> Vec<String> {
        let present = request_cookies(headers);
        let mut names = vec![self.name.clone()];
        names.extend(
            present
                .iter()
                .map(|(name, _)| name.clone())
                .filter(|name| is_chunk_of(name, &self.name)),
        );
        names
            .into_iter()
            .map(|name| self.build_cookie(&name, "", Some(0)))
            .collect()
    }

    /// The request's `Cookie` header with our session cookies removed, or
    /// None when no other cookies remain.
    pub fn strip_cookie_header(&self, headers: &HeaderMap) -> Option<String> {
        let remaining: Vec<String> = request_cookies(headers)
            .into_iter()
            .filter(|(name, _)| name != &self.name && !is_chunk_of(name, &self.name))
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        (!remaining.is_empty()).then(|| remaining.join("; "))
    }

    fn build_cookie(&self, name: &str, value: &str, max_age: Option<i64>) -> String {
        build_cookie(name, value, &self.attributes, max_age)
    }
}

/// Reads and writes the login-state cookie for one policy.
pub struct StateStore {
    cipher: Cipher,
    name: String,
    attributes: CookieAttributes,
}

/// Login state survives one round trip to the provider.
const STATE_COOKIE_MAX_AGE: i64 = 600;

impl StateStore {
    pub fn new(policy: &str, secret: &str, attributes: CookieAttributes) -> Self {
        Self {
            cipher: Cipher::new(secret),
            name: format!("{policy}-state"),
            attributes,
        }
    }

    pub fn cookie_for(&self, state: &StateData) -> Result<String, SessionError> {
        let plaintext = serde_json::to_vec(state)?;
        let value = URL_SAFE_NO_PAD.encode(self.cipher.encrypt(&plaintext)?);
        Ok(build_cookie(
            &self.name,
            &value,
            &self.attributes,
            Some(STATE_COOKIE_MAX_AGE),
        ))
    }

    pub fn load(&self, headers: &HeaderMap) -> Result<Option<StateData>, SessionError> {
        let cookies = request_cookies(headers);
        let Some((_, value)) = cookies.into_iter().find(|(name, _)| name == &self.name) else {
            return Ok(None);
        };
        let data = self.cipher.decrypt(&URL_SAFE_NO_PAD.decode(value.as_bytes())?)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    pub fn removal_cookie(&self) -> String {
        build_cookie(&self.name, "", &self.attributes, Some(0))
    }
}

fn is_chunk_of(name: &str, base: &str) -> bool {
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('-'))
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

fn build_cookie(
    name: &str,
    value: &str,
    attributes: &CookieAttributes,
    max_age: Option<i64>,
) -> String {
    let mut cookie = Cookie::build((name.to_string(), value.to_string()))
        .path(attributes.path.clone())
        .http_only(true)
        .same_site(attributes.same_site)
        .build();
    if attributes.secure {
        cookie.set_secure(true);
    }
    if let Some(domain) = &attributes.domain {
        cookie.set_domain(domain.clone());
    }
    if let Some(seconds) = max_age {
        cookie.set_max_age(cookie::time::Duration::seconds(seconds));
    }
    cookie.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn mk_headers(cookies: &[(String, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let joined = cookies
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert(COOKIE, HeaderValue::from_str(&joined).unwrap());
        headers
    }

    fn mk_session() -> SessionData {
        SessionData {
            access_token: "access-token-value".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("refresh-token-value".to_string()),
            id_token: "id-token-value".to_string(),
            expiry: 1_700_000_000,
        }
    }

    #[test]
    fn cipher_round_trip() {
        let cipher = Cipher::new("my-secret");
        let plaintext = b"some session payload";
        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_ne!(&encrypted[NONCE_SIZE..], plaintext.as_slice());
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn decrypt_rejects_wrong_key_and_garbage() {
        let encrypted = Cipher::new("one").encrypt(b"payload").unwrap();
        assert!(Cipher::new("two").decrypt(&encrypted).is_err());
        assert!(Cipher::new("one").decrypt(b"short").is_err());
    }

    #[test]
    fn small_value_keeps_bare_name() {
        let chunks = chunk_value("acp-session", "small", MAX_COOKIE_SIZE);
        assert_eq!(chunks, vec![("acp-session".to_string(), "small".to_string())]);
    }

    #[test]
    fn value_just_over_the_limit_splits_in_two() {
        let name = "acp-session";
        let value = "x".repeat(MAX_COOKIE_SIZE - name.len() + 1);
        let chunks = chunk_value(name, &value, MAX_COOKIE_SIZE);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, "acp-session-1");
        assert_eq!(chunks[1].0, "acp-session-2");
        assert_eq!(
            assemble_value(&chunks, name).unwrap(),
            value,
        );
    }

    #[test]
    fn chunk_reassembly_round_trip() {
        // max 26 with a one-byte name gives 22-byte chunks; 247 bytes of
        // payload spread over exactly 12 cookies.
        let value: String = (0..247).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk_value("s", &value, 26);
        assert_eq!(chunks.len(), 12);
        for (i, (name, _)) in chunks.iter().enumerate() {
            assert_eq!(name, &format!("s-{}", i + 1));
        }
        assert_eq!(assemble_value(&chunks, "s").unwrap(), value);
    }

    #[test]
    fn reassembly_stops_at_missing_chunk() {
        let cookies = vec![
            ("s-1".to_string(), "aa".to_string()),
            ("s-3".to_string(), "cc".to_string()),
        ];
        assert_eq!(assemble_value(&cookies, "s").unwrap(), "aa");
    }

    #[test]
    fn session_store_round_trip_chunked() {
        let store = SessionStore::new("acp", "secret", CookieAttributes::default())
            .with_max_size(64);
        let session = mk_session();

        let cookies = store.cookies_for(&session).unwrap();
        assert!(cookies.len() > 1, "payload must not fit one 64-byte cookie");

        // Feed the Set-Cookie values back as request cookies.
        let pairs: Vec<(String, String)> = cookies
            .iter()
            .map(|raw| {
                let parsed = Cookie::parse(raw.clone()).unwrap();
                (parsed.name().to_string(), parsed.value().to_string())
            })
            .collect();
        let headers = mk_headers(&pairs);
        assert_eq!(store.load(&headers).unwrap().unwrap(), session);
    }

    #[test]
    fn session_store_round_trip_single_cookie() {
        let store = SessionStore::new("acp", "secret", CookieAttributes::default());
        let session = mk_session();
        let cookies = store.cookies_for(&session).unwrap();
        assert_eq!(cookies.len(), 1);

        let parsed = Cookie::parse(cookies[0].clone()).unwrap();
        let headers = mk_headers(&[(parsed.name().to_string(), parsed.value().to_string())]);
        assert_eq!(store.load(&headers).unwrap().unwrap(), session);
    }

    #[test]
    fn removal_cookies_cover_all_chunks() {
        let store = SessionStore::new("acp", "secret", CookieAttributes::default());
        let headers = mk_headers(&[
            ("acp-session-1".to_string(), "a".to_string()),
            ("acp-session-2".to_string(), "b".to_string()),
            ("other".to_string(), "keep".to_string()),
        ]);
        let removals = store.removal_cookies(&headers);
        assert_eq!(removals.len(), 3);
        assert!(removals.iter().all(|c| c.contains("Max-Age=0")));
    }

    #[test]
    fn strip_cookie_header_keeps_foreign_cookies() {
        let store = SessionStore::new("acp", "secret", CookieAttributes::default());
        let headers = mk_headers(&[
            ("acp-session".to_string(), "ours".to_string()),
            ("acp-session-1".to_string(), "ours".to_string()),
            ("theirs".to_string(), "keep".to_string()),
        ]);
        assert_eq!(store.strip_cookie_header(&headers).unwrap(), "theirs=keep");

        let only_ours = mk_headers(&[("acp-session".to_string(), "ours".to_string())]);
        assert!(store.strip_cookie_header(&only_ours).is_none());
    }

    #[test]
    fn state_store_round_trip() {
        let store = StateStore::new("acp", "secret", CookieAttributes::default());
        let state = StateData {
            redirect_id: "abcdefghij0123456789".to_string(),
            nonce: "nonce-nonce-nonce-no".to_string(),
            origin_url: "http://app.example.com/page".to_string(),
            code_verifier: Some("verifier".to_string()),
        };

        let cookie = store.cookie_for(&state).unwrap();
        assert!(cookie.starts_with("acp-state="));
        assert!(cookie.contains("Max-Age=600"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));

        let parsed = Cookie::parse(cookie).unwrap();
        let headers = mk_headers(&[(parsed.name().to_string(), parsed.value().to_string())]);
        assert_eq!(store.load(&headers).unwrap().unwrap(), state);
    }

    #[test]
    fn chunk_name_detection() {
        assert!(is_chunk_of("acp-session-1", "acp-session"));
        assert!(is_chunk_of("acp-session-42", "acp-session"));
        assert!(!is_chunk_of("acp-session", "acp-session"));
        assert!(!is_chunk_of("acp-session-x", "acp-session"));
        assert!(!is_chunk_of("other-1", "acp-session"));
    }
}
