//! Shared domain primitives for the hub agent.
//!
//! This crate holds the pieces that several subsystems agree on: the claims
//! predicate language evaluated by the access-control handlers, dot-path
//! claim plucking, the stable spec digest used to detect no-op reconciles,
//! and the reconstruction of the request URL a forward-auth call stands for.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod claims;
pub mod expr;
pub mod forwarded;
pub mod hash;

pub use self::{
    claims::pluck,
    expr::Predicate,
    forwarded::{forwarded_method, forwarded_url, is_safe_method},
    hash::spec_hash,
};
