use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A named authentication/authorization policy applied to routes.
///
/// Exactly one variant field must be set; [`AccessControlPolicySpec::variant`]
/// enforces this at the point of use.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hub.traefik.io",
    version = "v1alpha1",
    kind = "AccessControlPolicy",
    status = "AccessControlPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuthConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeyConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_google: Option<OidcGoogleConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_auth_intro: Option<OAuthIntrospectionConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidSpec {
    #[error("an access control policy must configure exactly one authentication method")]
    NoVariant,

    #[error("an access control policy must configure exactly one authentication method, found {0}")]
    MultipleVariants(usize),
}

/// The single configured variant of a policy.
#[derive(Debug, Clone, PartialEq)]
pub enum AcpVariant<'a> {
    Jwt(&'a JwtConfig),
    BasicAuth(&'a BasicAuthConfig),
    ApiKey(&'a ApiKeyConfig),
    Oidc(&'a OidcConfig),
    OidcGoogle(&'a OidcGoogleConfig),
    OAuthIntro(&'a OAuthIntrospectionConfig),
}

impl AccessControlPolicySpec {
    /// Returns the configured variant, rejecting zero or multiple variants.
    pub fn variant(&self) -> Result<AcpVariant<'_>, InvalidSpec> {
        let mut found = Vec::new();
        if let Some(cfg) = &self.jwt {
            found.push(AcpVariant::Jwt(cfg));
        }
        if let Some(cfg) = &self.basic_auth {
            found.push(AcpVariant::BasicAuth(cfg));
        }
        if let Some(cfg) = &self.api_key {
            found.push(AcpVariant::ApiKey(cfg));
        }
        if let Some(cfg) = &self.oidc {
            found.push(AcpVariant::Oidc(cfg));
        }
        if let Some(cfg) = &self.oidc_google {
            found.push(AcpVariant::OidcGoogle(cfg));
        }
        if let Some(cfg) = &self.o_auth_intro {
            found.push(AcpVariant::OAuthIntro(cfg));
        }

        match found.len() {
            0 => Err(InvalidSpec::NoVariant),
            1 => Ok(found.remove(0)),
            n => Err(InvalidSpec::MultipleVariants(n)),
        }
    }
}

/// Where a handler finds the credential on the incoming request.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenSource {
    /// Header carrying the token, e.g. `Authorization`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,

    /// Scheme prefix expected on the header value, e.g. `Bearer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_auth_scheme: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JwtConfig {
    /// HMAC secret, optionally base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,

    #[serde(default)]
    pub signing_secret_base64_encoded: bool,

    /// PEM-encoded RSA or EC public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Inline JWKS document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_url: Option<String>,

    #[serde(default)]
    pub strip_authorization_header: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_source: Option<TokenSource>,

    /// Claims predicate; rejection yields 403.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<String>,

    /// `header name → claim dot-path` re-emitted on allowed responses.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthConfig {
    /// `user:bcrypt-hash` entries.
    #[serde(default)]
    pub users: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default)]
    pub strip_authorization_header: bool,

    /// Forward the authenticated username in this header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_username_header: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_source: Option<TokenSource>,

    #[serde(default)]
    pub keys: Vec<ApiKey>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,

    /// SHA-256 digest of the key, hex encoded.
    pub value: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    pub issuer: String,

    pub client_id: String,

    pub client_secret: String,

    /// Callback URL; either absolute or a path resolved against the
    /// forwarded host.
    pub redirect_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logout_url: Option<String>,

    #[serde(default)]
    pub scopes: Vec<String>,

    /// Extra parameters appended to the authorization request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth_params: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_cookie: Option<CookieConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
}

/// Google is a plain OIDC provider with a pinned issuer and an allow-list
/// of account emails.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OidcGoogleConfig {
    pub client_id: String,

    pub client_secret: String,

    pub redirect_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logout_url: Option<String>,

    #[serde(default)]
    pub emails: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth_params: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_cookie: Option<CookieConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CookieConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,

    #[serde(default)]
    pub secure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// AEAD secret protecting the session cookie.
    pub secret: String,

    /// Ask the provider for offline access and refresh expired sessions.
    #[serde(default)]
    pub refresh: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,

    #[serde(default)]
    pub secure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OAuthIntrospectionConfig {
    /// Introspection endpoint URL.
    pub url: String,

    pub auth: IntrospectionAuth,

    /// Extra headers on the introspection request. Values may reference the
    /// incoming request with `{{ .Request.Host }}`, `{{ .Request.Method }}`
    /// or `{{ .Request.Header.<Name> }}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type_hint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_source: Option<TokenSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
}

/// How the agent authenticates against the introspection endpoint.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum IntrospectionAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    Query { key: String, value: String },
    Header { key: String, value: String },
}

impl Default for IntrospectionAuth {
    fn default() -> Self {
        IntrospectionAuth::Bearer {
            token: String::new(),
        }
    }
}
