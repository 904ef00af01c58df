//! Well-known annotation and label keys the agent reads or writes.

/// References an AccessControlPolicy from an ingress-like resource.
pub const ACCESS_CONTROL_POLICY: &str = "hub.traefik.io/access-control-policy";

/// Legacy class annotation consulted alongside `spec.ingressClassName`.
pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";

/// Marks an IngressClass as the cluster default.
pub const DEFAULT_INGRESS_CLASS: &str = "ingressclass.kubernetes.io/is-default-class";

/// Stamped by the IngressUpdater to make controllers reload forward-auth
/// configuration after a policy change.
pub const LAST_POLICY_UPDATE: &str = "hub.traefik.io/last-access-control-policy-update";

pub const TRAEFIK_MIDDLEWARES: &str = "traefik.ingress.kubernetes.io/router.middlewares";
pub const TRAEFIK_ENTRY_POINTS: &str = "traefik.ingress.kubernetes.io/router.entrypoints";
pub const TRAEFIK_ROUTER_TLS: &str = "traefik.ingress.kubernetes.io/router.tls";

pub const NGINX_AUTH_URL: &str = "nginx.ingress.kubernetes.io/auth-url";
pub const NGINX_AUTH_RESPONSE_HEADERS: &str = "nginx.ingress.kubernetes.io/auth-response-headers";

pub const HAPROXY_AUTH_URL: &str = "haproxy-ingress.github.io/auth-url";
pub const HAPROXY_AUTH_HEADERS: &str = "haproxy-ingress.github.io/auth-headers-succeed";

/// Label carried by Ingresses materialised from EdgeIngresses.
pub const MANAGED_BY: &str = "kubernetes.io/managed-by";

/// Label carried by Secrets the agent owns.
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const MANAGED_BY_VALUE: &str = "traefik-hub";

/// Ingress class and entry point wiring edge traffic through the tunnel.
pub const EDGE_INGRESS_CLASS: &str = "traefik-hub";
pub const EDGE_INGRESS_ENTRY_POINT: &str = "traefikhub-tunl";
