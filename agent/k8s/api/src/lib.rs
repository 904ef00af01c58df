#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access_control_policy;
pub mod annotations;
pub mod api;
pub mod edge_ingress;
pub mod traefik;

pub use self::access_control_policy::{AccessControlPolicy, AccessControlPolicySpec};
pub use self::api::Api as HubApi;
pub use self::edge_ingress::EdgeIngress;
pub use k8s_openapi::{
    api::core::v1::{Secret, Service, ServicePort},
    api::networking::v1::{Ingress, IngressClass, IngressSpec},
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
    ByteString,
};
pub use kube::{
    api::{
        Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource,
        ResourceExt,
    },
    error::ErrorResponse,
    Client, Error,
};

/// API group of the hub custom resources.
pub const HUB_GROUP: &str = "hub.traefik.io";
pub const HUB_VERSION: &str = "v1alpha1";
