//! Platform connectivity: the retrying HTTP client, the reconciliation
//! watchers pulling desired state into the cluster, and the secrets the
//! agent maintains from platform-issued material.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod acp_watcher;
pub mod client;
pub mod command_watcher;
pub mod edge_ingress_watcher;
pub mod secrets;

pub use self::{
    acp_watcher::AcpWatcher,
    client::{PlatformClient, PlatformError},
    command_watcher::CommandWatcher,
    edge_ingress_watcher::EdgeIngressWatcher,
};
