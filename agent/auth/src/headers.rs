//! Response construction shared by the handlers.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, LOCATION, SET_COOKIE, WWW_AUTHENTICATE};
use http::StatusCode;
use http_body_util::Full;
use hub_agent_core::claims;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

pub type Response = http::Response<Full<Bytes>>;

/// NGINX auth-request mode: redirects are signalled through this header on
/// a 401 instead of a Location header on a 302.
pub const URL_REDIRECT_HEADER: &str = "url_redirect";

pub fn status(code: StatusCode) -> Response {
    http::Response::builder()
        .status(code)
        .body(Full::default())
        .expect("status response must be valid")
}

pub fn unauthorized() -> Response {
    status(StatusCode::UNAUTHORIZED)
}

pub fn unauthorized_basic(realm: &str) -> Response {
    let mut rsp = status(StatusCode::UNAUTHORIZED);
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm={realm:?}")) {
        rsp.headers_mut().insert(WWW_AUTHENTICATE, value);
    }
    rsp
}

pub fn forbidden() -> Response {
    status(StatusCode::FORBIDDEN)
}

pub fn internal_error() -> Response {
    status(StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn bad_request() -> Response {
    status(StatusCode::BAD_REQUEST)
}

pub fn redirect(url: &str) -> Response {
    let mut rsp = status(StatusCode::FOUND);
    if let Ok(value) = HeaderValue::from_str(url) {
        rsp.headers_mut().insert(LOCATION, value);
    }
    rsp
}

/// The NGINX-compatible rendition of a login redirect.
pub fn nginx_redirect(url: &str) -> Response {
    let mut rsp = status(StatusCode::UNAUTHORIZED);
    if let Ok(value) = HeaderValue::from_str(url) {
        rsp.headers_mut()
            .insert(HeaderName::from_static(URL_REDIRECT_HEADER), value);
    }
    rsp
}

pub fn set_cookies(rsp: &mut Response, cookies: &[String]) {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            rsp.headers_mut().append(SET_COOKIE, value);
        }
    }
}

/// Emits the configured `header name → claim dot-path` plucks.
pub fn forward_claims(
    rsp: &mut Response,
    forward_headers: &BTreeMap<String, String>,
    token_claims: &Value,
) {
    for (header, path) in forward_headers {
        let Some(value) = hub_agent_core::pluck(token_claims, path) else {
            debug!(%header, %path, "Forwarded claim not present in token");
            continue;
        };
        let rendered = claims::render(value);
        match (
            HeaderName::from_bytes(header.as_bytes()),
            HeaderValue::from_str(&rendered),
        ) {
            (Ok(name), Ok(value)) => {
                rsp.headers_mut().insert(name, value);
            }
            _ => debug!(%header, "Skipping unrepresentable forwarded claim"),
        }
    }
}
