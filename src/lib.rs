use k8s_openapi::api::networking::v1 as networking;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;

pub mod annotations;
pub mod class;
pub mod cluster;
pub mod health;
pub mod manager;
pub mod merge;
pub mod model;
pub mod ports;
pub mod resolvers;
pub mod rules;
pub mod store;
pub mod synth;
pub mod tls;

#[cfg(test)]
mod testing;

pub use manager::Manager;
pub use store::ResourceStore;

/// Partition of objects shared by every virtual (iRules, datagroups, bare profile names).
pub const COMMON_PARTITION: &str = "Common";

pub struct ControllerConfig {
    /// class name this instance answers to
    pub ingress_class: String,
    /// controller identifier expected in IngressClass resources
    pub controller_name: String,
    pub default_ingress_ip: String,
    pub snat_pool_name: String,
    pub partition: String,
    /// resolve the first rule's host when no bind address is annotated
    pub resolve_ingress: Option<resolvers::HostResolver>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ingress_class: "f5".into(),
            controller_name: "f5.com/cis-ingress-controller".into(),
            default_ingress_ip: String::new(),
            snat_pool_name: String::new(),
            partition: "k8s".into(),
            resolve_ingress: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}
impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}
impl TryFrom<&meta::ObjectMeta> for ObjectKey {
    type Error = &'static str;
    fn try_from(metadata: &meta::ObjectMeta) -> Result<Self, Self::Error> {
        Ok(Self {
            namespace: metadata.namespace.clone().ok_or("no namespace")?,
            name: metadata.name.clone().ok_or("no name")?,
        })
    }
}
impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum PortRef {
    Number(u16),
    Name(String),
}
impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(n) => write!(f, "{n}"),
        }
    }
}

/// A service reference taken from an Ingress backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub service: String,
    pub port: PortRef,
}
impl Backend {
    pub fn from_backend(backend: &networking::IngressBackend) -> Option<Self> {
        let Some(service) = backend.service.as_ref() else {
            return None;
        };
        let Some(port) = service.port.as_ref() else {
            return None;
        };
        let port = if let Some(number) = port.number {
            PortRef::Number(u16::try_from(number).ok()?)
        } else if let Some(name) = port.name.as_ref() {
            PortRef::Name(name.clone())
        } else {
            return None;
        };
        Some(Self {
            service: service.name.clone(),
            port,
        })
    }
}

pub fn annotations(ing: &networking::Ingress) -> &std::collections::BTreeMap<String, String> {
    static EMPTY: std::collections::BTreeMap<String, String> = std::collections::BTreeMap::new();
    ing.metadata.annotations.as_ref().unwrap_or(&EMPTY)
}

/// Name of the virtual bound to `bind_addr:port`.
pub fn format_vs_name(bind_addr: &str, port: i32) -> String {
    let addr: String = (bind_addr.trim_matches(|c| c == '[' || c == ']').chars())
        .map(|c| match c {
            '.' | ':' | '/' => '-',
            '%' => '.',
            c => c,
        })
        .collect();
    format!("ingress_{addr}_{port}")
}

pub fn format_pool_name(namespace: &str, service: &str, port: &PortRef) -> String {
    format!("ingress_{namespace}_{service}_{port}")
}

pub fn format_rule_name(host: &str, path: &str, pool: &str) -> String {
    if path.is_empty() {
        return format!("ingress_{host}_{pool}");
    }
    let path = path.strip_prefix('/').unwrap_or(path).replace('/', "_");
    format!("ingress_{host}_{path}_{pool}")
}

/// `/partition/name`
pub fn join_path(partition: &str, name: &str) -> String {
    format!("/{partition}/{name}")
}

/// Strips a `%<route domain>` suffix from an address.
pub fn split_route_domain(addr: &str) -> &str {
    addr.split_once('%').map_or(addr, |(ip, _)| ip)
}

#[cfg(test)]
mod test;
