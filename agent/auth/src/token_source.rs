//! Credential extraction from incoming requests.

use crate::session::request_cookies;
use http::request::Parts;
use hub_agent_k8s_api::access_control_policy::TokenSource;

/// The conventional `Authorization: Bearer` source.
pub fn bearer_authorization() -> TokenSource {
    TokenSource {
        header: Some("Authorization".to_string()),
        header_auth_scheme: Some("Bearer".to_string()),
        ..Default::default()
    }
}

/// Pulls the credential from the configured location: header first, then
/// query parameter, then cookie.
pub fn extract(source: &TokenSource, parts: &Parts) -> Option<String> {
    if let Some(header) = &source.header {
        if let Some(value) = parts
            .headers
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
        {
            match &source.header_auth_scheme {
                Some(scheme) => {
                    let mut split = value.splitn(2, ' ');
                    let got_scheme = split.next().unwrap_or_default();
                    if let Some(token) = split.next() {
                        if got_scheme.eq_ignore_ascii_case(scheme) && !token.is_empty() {
                            return Some(token.to_string());
                        }
                    }
                }
                None if !value.is_empty() => return Some(value.to_string()),
                None => {}
            }
        }
    }

    if let Some(key) = &source.query {
        if let Some(query) = parts.uri.query() {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if name == key.as_str() && !value.is_empty() {
                    return Some(value.into_owned());
                }
            }
        }
    }

    if let Some(name) = &source.cookie {
        for (cookie_name, value) in request_cookies(&parts.headers) {
            if &cookie_name == name && !value.is_empty() {
                return Some(value);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn bearer_header() {
        let source = bearer_authorization();
        let p = parts("/acp", &[("Authorization", "Bearer tok-123")]);
        assert_eq!(extract(&source, &p).as_deref(), Some("tok-123"));
    }

    #[test]
    fn scheme_mismatch_is_rejected() {
        let source = bearer_authorization();
        let p = parts("/acp", &[("Authorization", "Basic dXNlcg==")]);
        assert_eq!(extract(&source, &p), None);
    }

    #[test]
    fn raw_header_without_scheme() {
        let source = TokenSource {
            header: Some("X-Api-Key".to_string()),
            ..Default::default()
        };
        let p = parts("/acp", &[("X-Api-Key", "key-1")]);
        assert_eq!(extract(&source, &p).as_deref(), Some("key-1"));
    }

    #[test]
    fn query_parameter() {
        let source = TokenSource {
            query: Some("token".to_string()),
            ..Default::default()
        };
        let p = parts("/acp?token=tok-1&x=2", &[]);
        assert_eq!(extract(&source, &p).as_deref(), Some("tok-1"));
    }

    #[test]
    fn cookie_value() {
        let source = TokenSource {
            cookie: Some("token".to_string()),
            ..Default::default()
        };
        let p = parts("/acp", &[("Cookie", "a=b; token=tok-9")]);
        assert_eq!(extract(&source, &p).as_deref(), Some("tok-9"));
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let source = TokenSource {
            header: Some("X-Token".to_string()),
            query: Some("token".to_string()),
            ..Default::default()
        };
        let p = parts("/acp?token=from-query", &[("X-Token", "from-header")]);
        assert_eq!(extract(&source, &p).as_deref(), Some("from-header"));
    }

    #[test]
    fn missing_everywhere() {
        let source = bearer_authorization();
        let p = parts("/acp", &[]);
        assert_eq!(extract(&source, &p), None);
    }
}
