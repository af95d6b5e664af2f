use k8s_openapi::api::networking::v1 as networking;

use crate::annotations::IngressAnnotations;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPort {
    pub protocol: Protocol,
    pub port: i32,
}
impl std::fmt::Display for VirtualPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let proto = match self.protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        write!(f, "{proto}:{}", self.port)
    }
}

/// How an Ingress wants TLS handled.
///
/// | TLS | ssl-redirect | allow-http | state      |
/// |-----|--------------|------------|------------|
/// | no  |      -       |     -      | NoTls      |
/// | yes |    false     |   false    | HttpsOnly  |
/// | yes |    true      |     -      | Redirect   |
/// | yes |    false     |   true     | Both       |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    NoTls,
    HttpsOnly,
    Redirect,
    Both,
}
impl TlsState {
    pub fn of(has_tls: bool, ann: &IngressAnnotations) -> Self {
        match (has_tls, ann.ssl_redirect, ann.allow_http) {
            (false, _, _) => Self::NoTls,
            (true, true, _) => Self::Redirect,
            (true, false, true) => Self::Both,
            (true, false, false) => Self::HttpsOnly,
        }
    }
}

/// TLS is requested by a `tls` section or by an explicit client-ssl profile.
pub fn has_tls(ing: &networking::Ingress, ann: &IngressAnnotations) -> bool {
    let spec_tls = (ing.spec.as_ref())
        .and_then(|spec| spec.tls.as_ref())
        .is_some_and(|tls| !tls.is_empty());
    spec_tls || ann.client_ssl.is_some()
}

/// Ports the Ingress needs a virtual on, http first.
pub fn virtual_ports(ann: &IngressAnnotations, has_tls: bool) -> Vec<VirtualPort> {
    let http = VirtualPort {
        protocol: Protocol::Http,
        port: ann.http_port,
    };
    let https = VirtualPort {
        protocol: Protocol::Https,
        port: ann.https_port,
    };
    match TlsState::of(has_tls, ann) {
        TlsState::NoTls => vec![http],
        TlsState::HttpsOnly => vec![https],
        TlsState::Redirect | TlsState::Both => vec![http, https],
    }
}
