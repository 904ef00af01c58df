//! In-memory cluster state consulted by the admission webhook and the
//! access-control runtime.
//!
//! Two indexes are maintained from informer events: the ingress-class
//! registry (which controller owns a given class name) and the
//! access-control-policy index (the current policy set, published as
//! snapshots for the hot-swapped handler router). The IngressUpdater
//! consumes policy-change notifications and re-stamps annotated Ingresses
//! so controllers reload their forward-auth configuration.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod acp;
pub mod ingress_class;
pub mod updater;

pub use self::{
    acp::{AcpSnapshot, Index as AcpIndex},
    ingress_class::{ControllerTag, Registry, SharedRegistry},
    updater::IngressUpdater,
};
