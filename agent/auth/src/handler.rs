//! Per-policy handler construction and dispatch.

use crate::api_key::ApiKeyHandler;
use crate::basic_auth::BasicAuthHandler;
use crate::headers::Response;
use crate::jwt::JwtHandler;
use crate::oauth_intro::OAuthIntroHandler;
use crate::oidc::OidcHandler;
use http::request::Parts;
use hub_agent_k8s_api::access_control_policy::AcpVariant;
use hub_agent_k8s_api::AccessControlPolicySpec;

/// A compiled access-control handler for one policy.
pub enum AcpHandler {
    Jwt(JwtHandler),
    BasicAuth(BasicAuthHandler),
    ApiKey(ApiKeyHandler),
    Oidc(OidcHandler),
    OAuthIntro(OAuthIntroHandler),
}

impl AcpHandler {
    /// Compiles a policy spec. Fails when the spec has zero or multiple
    /// variants or the variant configuration is unusable.
    pub fn new(
        policy: &str,
        spec: &AccessControlPolicySpec,
        http: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let handler = match spec.variant()? {
            AcpVariant::Jwt(cfg) => AcpHandler::Jwt(JwtHandler::new(cfg, http)?),
            AcpVariant::BasicAuth(cfg) => AcpHandler::BasicAuth(BasicAuthHandler::new(cfg)?),
            AcpVariant::ApiKey(cfg) => AcpHandler::ApiKey(ApiKeyHandler::new(cfg)?),
            AcpVariant::Oidc(cfg) => AcpHandler::Oidc(OidcHandler::from_oidc(policy, cfg, http)?),
            AcpVariant::OidcGoogle(cfg) => {
                AcpHandler::Oidc(OidcHandler::from_google(policy, cfg, http)?)
            }
            AcpVariant::OAuthIntro(cfg) => {
                AcpHandler::OAuthIntro(OAuthIntroHandler::new(cfg, http)?)
            }
        };
        Ok(handler)
    }

    pub async fn serve(&self, parts: &Parts) -> Response {
        match self {
            AcpHandler::Jwt(handler) => handler.serve(parts).await,
            AcpHandler::BasicAuth(handler) => handler.serve(parts).await,
            AcpHandler::ApiKey(handler) => handler.serve(parts).await,
            AcpHandler::Oidc(handler) => handler.serve(parts).await,
            AcpHandler::OAuthIntro(handler) => handler.serve(parts).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_each_variant() {
        let http = reqwest::Client::new();
        let specs = [
            serde_json::json!({"jwt": {"signingSecret": "s"}}),
            serde_json::json!({"basicAuth": {"users": ["u:$2y$05$hash"]}}),
            serde_json::json!({"apiKey": {"keys": [{"id": "k", "value": "ab"}]}}),
            serde_json::json!({"oidc": {
                "issuer": "https://idp.example.com",
                "clientId": "c", "clientSecret": "s",
                "redirectUrl": "/cb",
                "session": {"secret": "x"}
            }}),
            serde_json::json!({"oAuthIntro": {
                "url": "https://idp.example.com/introspect",
                "auth": {"mode": "bearer", "token": "t"}
            }}),
        ];
        for spec in specs {
            let spec: AccessControlPolicySpec = serde_json::from_value(spec).unwrap();
            AcpHandler::new("p", &spec, http.clone()).unwrap();
        }
    }

    #[test]
    fn empty_spec_does_not_compile() {
        let spec = AccessControlPolicySpec::default();
        assert!(AcpHandler::new("p", &spec, reqwest::Client::new()).is_err());
    }
}
