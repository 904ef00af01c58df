//! The access-control runtime.
//!
//! An HTTP server consulted by ingress controllers as a forward-auth
//! endpoint. The URL path names the policy; the matching handler decides
//! 200/401/403 and emits the headers the controller copies upstream.
//! Handlers are compiled from AccessControlPolicy resources and hot-swapped
//! whenever the policy set changes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod api_key;
pub mod basic_auth;
pub mod handler;
pub mod headers;
pub mod jwt;
pub mod oauth_intro;
pub mod oidc;
pub mod session;
pub mod switcher;
pub mod token_source;

pub use self::{
    handler::AcpHandler,
    switcher::{serve, watch_policies, Switcher},
};
