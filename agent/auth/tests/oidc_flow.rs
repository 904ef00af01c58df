//! End-to-end OIDC flow against a canned provider: initial redirect,
//! code-exchange callback, and the NGINX compatibility mode.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::header::{LOCATION, SET_COOKIE};
use http::{Method, Request, StatusCode};
use hub_agent_auth::oidc::OidcHandler;
use hub_agent_k8s_api::access_control_policy::OidcConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

const HS_SECRET: &[u8] = b"provider-signing-secret";
const KID: &str = "k1";

/// A minimal OIDC provider: discovery, JWKS and a token endpoint whose
/// response body the test swaps in once it knows the nonce.
struct Provider {
    addr: SocketAddr,
    token_response: Arc<Mutex<String>>,
}

async fn spawn_provider() -> Provider {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token_response = Arc::new(Mutex::new("{}".to_string()));

    let jwk_value = URL_SAFE_NO_PAD.encode(HS_SECRET);
    let jwks = serde_json::json!({
        "keys": [{"kty": "oct", "kid": KID, "alg": "HS256", "k": jwk_value}]
    })
    .to_string();
    let discovery = serde_json::json!({
        "issuer": format!("http://{addr}"),
        "authorization_endpoint": format!("http://{addr}/authorize"),
        "token_endpoint": format!("http://{addr}/token"),
        "jwks_uri": format!("http://{addr}/jwks"),
    })
    .to_string();

    let tokens = token_response.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            // Read the header block, then drain any Content-Length body so
            // the client never sees a reset mid-request.
            let header_end = loop {
                let Ok(n) = stream.read(&mut chunk).await else {
                    break None;
                };
                if n == 0 {
                    break None;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break Some(pos + 4);
                }
            };
            let Some(header_end) = header_end else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                let Ok(n) = stream.read(&mut chunk).await else {
                    break;
                };
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let path = head
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or("/")
                .to_string();

            let body = if path.starts_with("/.well-known") {
                discovery.clone()
            } else if path.starts_with("/jwks") {
                jwks.clone()
            } else if path.starts_with("/token") {
                tokens.lock().unwrap().clone()
            } else {
                "{}".to_string()
            };
            let rsp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body,
            );
            let _ = stream.write_all(rsp.as_bytes()).await;
        }
    });

    Provider {
        addr,
        token_response,
    }
}

fn mk_handler(provider: &Provider) -> OidcHandler {
    let cfg: OidcConfig = serde_json::from_value(serde_json::json!({
        "issuer": format!("http://{}", provider.addr),
        "clientId": "client-1",
        "clientSecret": "secret-1",
        "redirectUrl": "/callback",
        "scopes": ["profile"],
        "session": {"secret": "cookie-secret"}
    }))
    .unwrap();
    OidcHandler::from_oidc("my-acp", &cfg, reqwest::Client::new()).unwrap()
}

fn mk_parts(method: Method, headers: &[(&str, String)]) -> http::request::Parts {
    let mut builder = Request::builder().method(method).uri("/my-acp");
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    builder.body(()).unwrap().into_parts().0
}

fn forwarded(uri: &str) -> Vec<(&'static str, String)> {
    vec![
        ("X-Forwarded-Proto", "http".to_string()),
        ("X-Forwarded-Host", "app.example.com".to_string()),
        ("X-Forwarded-Uri", uri.to_string()),
    ]
}

fn set_cookies(rsp: &http::Response<http_body_util::Full<bytes::Bytes>>) -> Vec<String> {
    rsp.headers()
        .get_all(SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

fn cookie_header(set_cookies: &[String]) -> String {
    set_cookies
        .iter()
        .map(|raw| {
            let parsed = cookie::Cookie::parse(raw.clone()).unwrap();
            format!("{}={}", parsed.name(), parsed.value())
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn sign_id_token(nonce: &str) -> String {
    let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
    header.kid = Some(KID.to_string());
    jsonwebtoken::encode(
        &header,
        &serde_json::json!({
            "sub": "alice",
            "aud": "client-1",
            "nonce": nonce,
            "email": "alice@example.com",
        }),
        &jsonwebtoken::EncodingKey::from_secret(HS_SECRET),
    )
    .unwrap()
}

#[tokio::test]
async fn initial_request_redirects_to_the_provider() {
    let provider = spawn_provider().await;
    let handler = mk_handler(&provider);

    let rsp = handler
        .serve(&mk_parts(Method::GET, &forwarded("/page")))
        .await;
    assert_eq!(rsp.status(), StatusCode::FOUND);

    let location = Url::parse(rsp.headers()[LOCATION].to_str().unwrap()).unwrap();
    assert!(location.as_str().starts_with(&format!(
        "http://{}/authorize?",
        provider.addr
    )));

    let query: HashMap<String, String> = location
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert_eq!(query["client_id"], "client-1");
    assert_eq!(query["response_type"], "code");
    assert_eq!(query["redirect_uri"], "http://app.example.com/callback");
    assert_eq!(query["state"].len(), 20);
    assert_eq!(query["nonce"].len(), 20);
    assert!(query["scope"].split(' ').any(|s| s == "openid"));

    let cookies = set_cookies(&rsp);
    assert_eq!(cookies.len(), 1);
    assert!(cookies[0].starts_with("my-acp-state="));
    assert!(cookies[0].contains("Max-Age=600"));
    assert!(cookies[0].contains("HttpOnly"));
    assert!(cookies[0].contains("SameSite=Lax"));
}

#[tokio::test]
async fn nginx_mode_gets_a_401_with_url_redirect() {
    let provider = spawn_provider().await;
    let handler = mk_handler(&provider);

    let mut headers = forwarded("/page");
    headers.push(("From", "nginx".to_string()));
    let rsp = handler.serve(&mk_parts(Method::GET, &headers)).await;

    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    let redirect = rsp.headers()["url_redirect"].to_str().unwrap();
    assert!(redirect.starts_with(&format!("http://{}/authorize?", provider.addr)));
}

#[tokio::test]
async fn callback_establishes_a_session_and_redirects_to_the_origin() {
    let provider = spawn_provider().await;
    let handler = mk_handler(&provider);

    // Step 1: pick up the state cookie and the nonce from the redirect.
    let login = handler
        .serve(&mk_parts(Method::GET, &forwarded("/page")))
        .await;
    let location = Url::parse(login.headers()[LOCATION].to_str().unwrap()).unwrap();
    let query: HashMap<String, String> = location
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let state_cookies = set_cookies(&login);

    // Arm the provider with a token response for this login.
    let id_token = sign_id_token(&query["nonce"]);
    *provider.token_response.lock().unwrap() = serde_json::json!({
        "access_token": "access-1",
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": "refresh-1",
        "id_token": id_token,
    })
    .to_string();

    // Step 2: the provider calls back with the code.
    let mut headers = forwarded(&format!("/callback?state={}&code=code-1", query["state"]));
    headers.push(("Cookie", cookie_header(&state_cookies)));
    let callback = handler.serve(&mk_parts(Method::GET, &headers)).await;

    assert_eq!(callback.status(), StatusCode::FOUND);
    assert_eq!(
        callback.headers()[LOCATION].to_str().unwrap(),
        "http://app.example.com/page"
    );

    let cookies = set_cookies(&callback);
    assert!(cookies
        .iter()
        .any(|c| c.starts_with("my-acp-session") && !c.contains("Max-Age=0")));
    // The state cookie is cleared.
    assert!(cookies
        .iter()
        .any(|c| c.starts_with("my-acp-state=") && c.contains("Max-Age=0")));

    // Step 3: the session cookie now authenticates requests.
    let mut headers = forwarded("/page");
    let session_cookies: Vec<String> = cookies
        .iter()
        .filter(|c| c.starts_with("my-acp-session"))
        .cloned()
        .collect();
    headers.push(("Cookie", cookie_header(&session_cookies)));
    let allowed = handler.serve(&mk_parts(Method::GET, &headers)).await;

    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(
        allowed.headers()[http::header::AUTHORIZATION],
        "Bearer access-1"
    );
}

#[tokio::test]
async fn callback_with_a_tampered_state_is_rejected() {
    let provider = spawn_provider().await;
    let handler = mk_handler(&provider);

    let login = handler
        .serve(&mk_parts(Method::GET, &forwarded("/page")))
        .await;
    let state_cookies = set_cookies(&login);

    let mut headers = forwarded("/callback?state=forged&code=code-1");
    headers.push(("Cookie", cookie_header(&state_cookies)));
    let callback = handler.serve(&mk_parts(Method::GET, &headers)).await;

    assert_eq!(callback.status(), StatusCode::BAD_REQUEST);
}
