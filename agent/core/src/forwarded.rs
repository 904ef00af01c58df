//! Reconstruction of the request a forward-auth call stands for.
//!
//! The ingress controller calls the auth server with the original request
//! described in `X-Forwarded-*` headers; handlers that redirect (OIDC) need
//! the full original URL back.

use http::{header::HeaderMap, Method};
use thiserror::Error;
use url::Url;

pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_URI: &str = "x-forwarded-uri";
pub const X_FORWARDED_METHOD: &str = "x-forwarded-method";

#[derive(Debug, Error)]
pub enum ForwardedError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid forwarded URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Rebuilds the original request URL from `X-Forwarded-{Proto,Host,Uri}`.
///
/// The proto defaults to `http` when absent; host is required.
pub fn forwarded_url(headers: &HeaderMap) -> Result<Url, ForwardedError> {
    let proto = headers
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(X_FORWARDED_HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or(ForwardedError::MissingHeader(X_FORWARDED_HOST))?;
    let uri = headers
        .get(X_FORWARDED_URI)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("/");

    Ok(Url::parse(&format!("{proto}://{host}{uri}"))?)
}

/// The method of the original request, falling back to the method of the
/// forward-auth call itself when the controller does not forward one.
pub fn forwarded_method(headers: &HeaderMap, fallback: &Method) -> Method {
    headers
        .get(X_FORWARDED_METHOD)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Method>().ok())
        .unwrap_or_else(|| fallback.clone())
}

/// Whether a request method is safe to answer with a login redirect.
///
/// Writes get a 401 instead: redirecting a POST loses the body.
pub fn is_safe_method(method: &Method) -> bool {
    !matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(entries: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn rebuilds_url() {
        let h = headers(&[
            (X_FORWARDED_PROTO, "https"),
            (X_FORWARDED_HOST, "app.example.com"),
            (X_FORWARDED_URI, "/page?q=1"),
        ]);
        let url = forwarded_url(&h).unwrap();
        assert_eq!(url.as_str(), "https://app.example.com/page?q=1");
    }

    #[test]
    fn proto_and_uri_default() {
        let h = headers(&[(X_FORWARDED_HOST, "app.example.com")]);
        let url = forwarded_url(&h).unwrap();
        assert_eq!(url.as_str(), "http://app.example.com/");
    }

    #[test]
    fn missing_host_is_an_error() {
        let h = headers(&[(X_FORWARDED_PROTO, "http")]);
        assert!(matches!(
            forwarded_url(&h),
            Err(ForwardedError::MissingHeader(X_FORWARDED_HOST))
        ));
    }

    #[test]
    fn forwarded_method_overrides_fallback() {
        let h = headers(&[(X_FORWARDED_METHOD, "POST")]);
        assert_eq!(forwarded_method(&h, &Method::GET), Method::POST);
        assert_eq!(forwarded_method(&HeaderMap::new(), &Method::GET), Method::GET);
    }

    #[test]
    fn safe_methods() {
        assert!(is_safe_method(&Method::GET));
        assert!(is_safe_method(&Method::HEAD));
        assert!(is_safe_method(&Method::OPTIONS));
        assert!(!is_safe_method(&Method::POST));
        assert!(!is_safe_method(&Method::PUT));
        assert!(!is_safe_method(&Method::PATCH));
        assert!(!is_safe_method(&Method::DELETE));
    }
}
