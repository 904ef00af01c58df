//! OAuth2 token introspection (RFC 7662) handler.

use crate::headers::{self, Response};
use crate::token_source;
use http::request::Parts;
use hub_agent_core::Predicate;
use hub_agent_k8s_api::access_control_policy::{
    IntrospectionAuth, OAuthIntrospectionConfig, TokenSource,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub struct OAuthIntroHandler {
    url: String,
    auth: IntrospectionAuth,
    extra_headers: BTreeMap<String, String>,
    token_type_hint: Option<String>,
    source: TokenSource,
    predicate: Option<Predicate>,
    forward_headers: BTreeMap<String, String>,
    http: reqwest::Client,
}

impl OAuthIntroHandler {
    pub fn new(cfg: &OAuthIntrospectionConfig, http: reqwest::Client) -> anyhow::Result<Self> {
        let predicate = cfg.claims.as_deref().map(Predicate::parse).transpose()?;
        Ok(Self {
            url: cfg.url.clone(),
            auth: cfg.auth.clone(),
            extra_headers: cfg.headers.clone(),
            token_type_hint: cfg.token_type_hint.clone(),
            source: cfg
                .token_source
                .clone()
                .unwrap_or_else(token_source::bearer_authorization),
            predicate,
            forward_headers: cfg.forward_headers.clone(),
            http,
        })
    }

    pub async fn serve(&self, parts: &Parts) -> Response {
        let Some(token) = token_source::extract(&self.source, parts) else {
            return headers::unauthorized();
        };

        let mut form = vec![("token".to_string(), token)];
        if let Some(hint) = &self.token_type_hint {
            form.push(("token_type_hint".to_string(), hint.clone()));
        }

        let mut request = self.http.post(&self.url);
        request = match &self.auth {
            IntrospectionAuth::Bearer { token } => request.bearer_auth(token),
            IntrospectionAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            IntrospectionAuth::Query { key, value } => request.query(&[(key, value)]),
            IntrospectionAuth::Header { key, value } => request.header(key.as_str(), value.as_str()),
        };
        for (name, template) in &self.extra_headers {
            request = request.header(name.as_str(), render_template(template, parts));
        }

        let rsp = match request.form(&form).send().await {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%error, "Introspection endpoint unreachable");
                return headers::internal_error();
            }
        };
        if rsp.status() != reqwest::StatusCode::OK {
            warn!(status = %rsp.status(), "Unexpected introspection response");
            return headers::internal_error();
        }

        let claims: Value = match rsp.json().await {
            Ok(claims) => claims,
            Err(error) => {
                warn!(%error, "Introspection response is not JSON");
                return headers::internal_error();
            }
        };

        if claims.get("active").and_then(Value::as_bool) != Some(true) {
            debug!("Token is not active");
            return headers::unauthorized();
        }

        if let Some(predicate) = &self.predicate {
            if !predicate.eval(&claims) {
                return headers::forbidden();
            }
        }

        let mut out = headers::status(http::StatusCode::OK);
        headers::forward_claims(&mut out, &self.forward_headers, &claims);
        out
    }
}

/// Expands `{{ .Request.Host }}`, `{{ .Request.Method }}` and
/// `{{ .Request.Header.<Name> }}` references in a header template.
pub fn render_template(template: &str, parts: &Parts) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        let Some(end) = tail.find("}}") else {
            out.push_str(tail);
            return out;
        };
        let expr = tail[2..end].trim();
        out.push_str(&eval_template_expr(expr, parts));
        rest = &tail[end + 2..];
    }
    out.push_str(rest);
    out
}

fn eval_template_expr(expr: &str, parts: &Parts) -> String {
    match expr {
        ".Request.Host" => parts
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        ".Request.Method" => parts.method.to_string(),
        _ => match expr.strip_prefix(".Request.Header.") {
            Some(name) => parts
                .headers
                .get(name.trim())
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            None => String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn mk_parts(method: http::Method, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri("/my-acp");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn template_expands_request_fields() {
        let parts = mk_parts(
            http::Method::POST,
            &[("Host", "app.example.com"), ("X-Trace", "t-1")],
        );
        assert_eq!(
            render_template("{{ .Request.Method }} {{ .Request.Host }}", &parts),
            "POST app.example.com"
        );
        assert_eq!(
            render_template("trace={{ .Request.Header.X-Trace }}", &parts),
            "trace=t-1"
        );
    }

    #[test]
    fn template_handles_missing_and_unknown_references() {
        let parts = mk_parts(http::Method::GET, &[]);
        assert_eq!(render_template("{{ .Request.Host }}", &parts), "");
        assert_eq!(render_template("{{ .Something.Else }}", &parts), "");
        assert_eq!(render_template("plain text", &parts), "plain text");
        assert_eq!(render_template("open {{ .Request.Host", &parts), "open {{ .Request.Host");
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let cfg: OAuthIntrospectionConfig = serde_json::from_value(serde_json::json!({
            "url": "http://127.0.0.1:1/introspect",
            "auth": {"mode": "bearer", "token": "t"}
        }))
        .unwrap();
        let handler = OAuthIntroHandler::new(&cfg, reqwest::Client::new()).unwrap();
        let rsp = handler.serve(&mk_parts(http::Method::GET, &[])).await;
        assert_eq!(rsp.status(), http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unreachable_introspection_endpoint_is_an_internal_error() {
        let cfg: OAuthIntrospectionConfig = serde_json::from_value(serde_json::json!({
            "url": "http://127.0.0.1:1/introspect",
            "auth": {"mode": "basic", "username": "u", "password": "p"}
        }))
        .unwrap();
        let handler = OAuthIntroHandler::new(&cfg, reqwest::Client::new()).unwrap();
        let parts = mk_parts(http::Method::GET, &[("Authorization", "Bearer tok")]);
        assert_eq!(
            handler.serve(&parts).await.status(),
            http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
