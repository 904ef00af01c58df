//! The ingress-class registry.
//!
//! Maps a class reference (the `spec.ingressClassName` field or the legacy
//! `kubernetes.io/ingress.class` annotation value) to the controller
//! implementation behind it. Populated from IngressClass informer events;
//! consulted by the admission reviewers to decide which reviewer owns a
//! resource.

use ahash::AHashMap as HashMap;
use hub_agent_k8s_api::{annotations, IngressClass, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

pub const CONTROLLER_TRAEFIK: &str = "traefik.io/ingress-controller";
pub const CONTROLLER_NGINX: &str = "k8s.io/ingress-nginx";
pub const CONTROLLER_HAPROXY: &str = "haproxy-ingress.github.io/controller";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerTag {
    Traefik,
    Nginx,
    Haproxy,
    Other,
    /// Two classes with conflicting controllers answer to the same key.
    Ambiguous,
}

impl ControllerTag {
    fn from_controller(controller: &str) -> Self {
        match controller {
            CONTROLLER_TRAEFIK => ControllerTag::Traefik,
            CONTROLLER_NGINX => ControllerTag::Nginx,
            CONTROLLER_HAPROXY => ControllerTag::Haproxy,
            _ => ControllerTag::Other,
        }
    }

    /// Interprets a bare class value with no backing IngressClass resource.
    fn from_literal(name: &str) -> Self {
        match name {
            "traefik" => ControllerTag::Traefik,
            "nginx" => ControllerTag::Nginx,
            "haproxy" => ControllerTag::Haproxy,
            _ => ControllerTag::Other,
        }
    }
}

pub type SharedRegistry = Arc<RwLock<Registry>>;

#[derive(Debug, Default)]
pub struct Registry {
    /// `class key → class resource name → tag`. A key resolves ambiguous
    /// when distinct controllers claim it.
    by_key: HashMap<String, HashMap<String, ControllerTag>>,

    /// Classes marked `ingressclass.kubernetes.io/is-default-class`.
    defaults: HashMap<String, ControllerTag>,
}

impl Registry {
    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Resolves the controller owning a resource given its
    /// `spec.ingressClassName` and legacy class annotation.
    pub fn resolve(&self, class_name: Option<&str>, legacy: Option<&str>) -> ControllerTag {
        match (class_name, legacy) {
            (Some(class), Some(annotation)) => {
                let a = self.lookup(class);
                let b = self.lookup(annotation);
                if a == b {
                    a
                } else {
                    ControllerTag::Ambiguous
                }
            }
            (Some(key), None) | (None, Some(key)) => self.lookup(key),
            (None, None) => self.default_class(),
        }
    }

    fn lookup(&self, key: &str) -> ControllerTag {
        match self.by_key.get(key) {
            Some(classes) => {
                let mut tags = classes.values();
                let first = match tags.next() {
                    Some(tag) => *tag,
                    None => return ControllerTag::from_literal(key),
                };
                if tags.all(|tag| *tag == first) {
                    first
                } else {
                    ControllerTag::Ambiguous
                }
            }
            None => ControllerTag::from_literal(key),
        }
    }

    fn default_class(&self) -> ControllerTag {
        let mut tags = self.defaults.values();
        let first = match tags.next() {
            Some(tag) => *tag,
            None => return ControllerTag::Other,
        };
        if tags.all(|tag| *tag == first) {
            first
        } else {
            ControllerTag::Ambiguous
        }
    }

    fn insert(&mut self, class: &IngressClass) {
        let name = class.name_unchecked();
        let tag = class
            .spec
            .as_ref()
            .and_then(|spec| spec.controller.as_deref())
            .map(ControllerTag::from_controller)
            .unwrap_or(ControllerTag::Other);

        self.remove(&name);

        self.by_key
            .entry(name.clone())
            .or_default()
            .insert(name.clone(), tag);
        if let Some(legacy) = class.annotations().get(annotations::INGRESS_CLASS) {
            self.by_key
                .entry(legacy.clone())
                .or_default()
                .insert(name.clone(), tag);
        }
        if class
            .annotations()
            .get(annotations::DEFAULT_INGRESS_CLASS)
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            self.defaults.insert(name.clone(), tag);
        }
        debug!(%name, ?tag, "Indexed ingress class");
    }

    fn remove(&mut self, name: &str) {
        self.by_key.retain(|_, classes| {
            classes.remove(name);
            !classes.is_empty()
        });
        self.defaults.remove(name);
    }
}

impl kubert::index::IndexClusterResource<IngressClass> for Registry {
    fn apply(&mut self, class: IngressClass) {
        self.insert(&class);
    }

    fn delete(&mut self, name: String) {
        self.remove(&name);
        debug!(%name, "Removed ingress class");
    }
}
