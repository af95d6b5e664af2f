//! Typed view of the annotations this controller understands.
//!
//! Everything is parsed once per reconcile; malformed values fall back to the documented
//! default and are collected in [`IngressAnnotations::errors`] so the caller can report them.

use serde::Deserialize;
use std::collections::BTreeMap as Map;

pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
pub const DEFAULT_INGRESS_CLASS: &str = "ingressclass.kubernetes.io/is-default-class";

pub const BIND_ADDR: &str = "virtual-server.f5.com/ip";
pub const HTTP_PORT: &str = "virtual-server.f5.com/http-port";
pub const HTTPS_PORT: &str = "virtual-server.f5.com/https-port";
pub const PARTITION: &str = "virtual-server.f5.com/partition";
pub const BALANCE: &str = "virtual-server.f5.com/balance";
pub const HEALTH: &str = "virtual-server.f5.com/health";
pub const CLIENT_SSL: &str = "virtual-server.f5.com/clientssl";
pub const SERVER_SSL: &str = "virtual-server.f5.com/serverssl";
pub const APP_ROOT: &str = "virtual-server.f5.com/rewrite-app-root";
pub const URL_REWRITE: &str = "virtual-server.f5.com/rewrite-target-url";
pub const WHITELIST_SOURCE_RANGE: &str = "virtual-server.f5.com/whitelist-source-range";
pub const ALLOW_SOURCE_RANGE: &str = "virtual-server.f5.com/allow-source-range";
pub const SSL_REDIRECT: &str = "ingress.kubernetes.io/ssl-redirect";
pub const ALLOW_HTTP: &str = "ingress.kubernetes.io/allow-http";

/// Bind address value meaning "use the controller's default ingress IP".
pub const CONTROLLER_DEFAULT: &str = "controller-default";
/// Key of an app-root/url-rewrite value given without a target.
pub const SINGLE_TARGET: &str = "single";

pub const DEFAULT_HTTP_PORT: i32 = 80;
pub const DEFAULT_HTTPS_PORT: i32 = 443;
pub const DEFAULT_BALANCE: &str = "round-robin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    InvalidBool { key: &'static str, value: String },
    InvalidPort { key: &'static str, value: String },
    InvalidPair { key: &'static str, value: String },
    InvalidJson { key: &'static str, error: String },
}
impl std::fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBool { key, value } => {
                write!(f, "unable to parse boolean value {value:?} of {key}")
            }
            Self::InvalidPort { key, value } => {
                write!(f, "unable to parse port {value:?} of {key}, using 0")
            }
            Self::InvalidPair { key, value } => {
                write!(f, "invalid key=value entry {value:?} in {key}")
            }
            Self::InvalidJson { key, error } => write!(f, "unable to parse {key}: {error}"),
        }
    }
}

/// One entry of the health monitor annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct HealthMonitorSpec {
    /// `host/path`, host may be `*`
    pub path: String,
    #[serde(default)]
    pub send: String,
    #[serde(default)]
    pub recv: String,
    #[serde(default)]
    pub interval: i32,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
}

#[derive(Deserialize)]
struct ClientSslEntry {
    #[serde(rename = "bigipProfile")]
    bigip_profile: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngressAnnotations {
    pub class: Option<String>,
    pub bind_addr: Option<String>,
    pub http_port: i32,
    pub https_port: i32,
    pub partition: Option<String>,
    pub balance: String,
    pub ssl_redirect: bool,
    pub allow_http: bool,
    /// Set when the client-ssl annotation is non-empty; empty if it could not be parsed.
    pub client_ssl: Option<Vec<String>>,
    pub server_ssl: Option<String>,
    /// url-rewrite targets, keyed by `host/path`
    pub url_rewrite: Option<Map<String, String>>,
    /// app-root targets, keyed by host (or [`SINGLE_TARGET`])
    pub app_root: Option<Map<String, String>>,
    pub source_ranges: Vec<String>,
    pub health_monitors: Vec<HealthMonitorSpec>,
    pub errors: Vec<AnnotationError>,
}

impl IngressAnnotations {
    pub fn parse(annotations: &Map<String, String>) -> Self {
        let mut errors = Vec::new();
        let get = |key: &str| annotations.get(key).map(|v| v.as_str());

        let port = |key: &'static str, default: i32, errors: &mut Vec<AnnotationError>| {
            let Some(value) = get(key) else {
                return default;
            };
            // malformed ports become 0, as they always have
            value.parse::<i32>().unwrap_or_else(|_| {
                errors.push(AnnotationError::InvalidPort {
                    key,
                    value: value.to_string(),
                });
                0
            })
        };
        let http_port = port(HTTP_PORT, DEFAULT_HTTP_PORT, &mut errors);
        let https_port = port(HTTPS_PORT, DEFAULT_HTTPS_PORT, &mut errors);

        let ssl_redirect = bool_annotation(annotations, SSL_REDIRECT, true, &mut errors);
        let allow_http = bool_annotation(annotations, ALLOW_HTTP, false, &mut errors);

        let client_ssl = get(CLIENT_SSL).filter(|v| !v.is_empty()).map(|value| {
            match serde_json::from_str::<Vec<ClientSslEntry>>(value) {
                Ok(entries) => entries.into_iter().map(|e| e.bigip_profile).collect(),
                Err(e) => {
                    errors.push(AnnotationError::InvalidJson {
                        key: CLIENT_SSL,
                        error: e.to_string(),
                    });
                    Vec::new()
                }
            }
        });

        let health_monitors: Vec<HealthMonitorSpec> = match get(HEALTH) {
            None => Vec::new(),
            Some(value) => serde_json::from_str(value).unwrap_or_else(|e| {
                errors.push(AnnotationError::InvalidJson {
                    key: HEALTH,
                    error: e.to_string(),
                });
                Vec::new()
            }),
        };

        let url_rewrite = get(URL_REWRITE).map(|v| parse_targets(URL_REWRITE, v, &mut errors));
        let app_root = get(APP_ROOT).map(|v| parse_targets(APP_ROOT, v, &mut errors));

        let source_ranges = get(WHITELIST_SOURCE_RANGE)
            .or_else(|| get(ALLOW_SOURCE_RANGE))
            .map(parse_source_ranges)
            .unwrap_or_default();

        Self {
            class: get(INGRESS_CLASS).map(String::from),
            bind_addr: get(BIND_ADDR).map(String::from),
            http_port,
            https_port,
            partition: get(PARTITION).map(String::from),
            balance: get(BALANCE).unwrap_or(DEFAULT_BALANCE).to_string(),
            ssl_redirect,
            allow_http,
            client_ssl,
            server_ssl: get(SERVER_SSL).map(String::from),
            url_rewrite,
            app_root,
            source_ranges,
            health_monitors,
            errors,
        }
    }
}

/// Boolean annotation accepting the usual `1/t/true/TRUE/...` spellings.
pub fn bool_annotation(
    annotations: &Map<String, String>,
    key: &'static str,
    default: bool,
    errors: &mut Vec<AnnotationError>,
) -> bool {
    let Some(value) = annotations.get(key) else {
        return default;
    };
    match parse_bool(value) {
        Some(b) => b,
        None => {
            errors.push(AnnotationError::InvalidBool {
                key,
                value: value.clone(),
            });
            default
        }
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// `value` alone means [`SINGLE_TARGET`], otherwise `target=value[,target=value...]`.
fn parse_targets(
    key: &'static str,
    value: &str,
    errors: &mut Vec<AnnotationError>,
) -> Map<String, String> {
    let mut targets = Map::new();
    if !value.contains('=') {
        targets.insert(SINGLE_TARGET.to_string(), value.trim().to_string());
        return targets;
    }
    for pair in value.split(',') {
        match pair.split('=').collect::<Vec<_>>()[..] {
            [target, value] => {
                targets.insert(target.trim().to_string(), value.trim().to_string());
            }
            _ => errors.push(AnnotationError::InvalidPair {
                key,
                value: pair.to_string(),
            }),
        }
    }
    targets
}

fn parse_source_ranges(value: &str) -> Vec<String> {
    value.split(',').map(|v| v.trim().to_string()).collect()
}
