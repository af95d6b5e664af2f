//! TLS handling of an Ingress' virtuals: client/server profiles on the https virtual,
//! the https redirect on the http one.

use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use kube::runtime::events::EventType;
use log::{debug, error, warn};
use openssl::{pkey::PKey, x509::X509};
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::{
    Backend, COMMON_PARTITION, ObjectKey,
    annotations::IngressAnnotations,
    cluster::{EventRecorder, reasons},
    join_path,
    model::{
        CustomProfile, IRule, InternalDataGroup, ProfileContext, ProfileRef, ResourceConfig,
    },
    ports::{Protocol, TlsState, VirtualPort},
    store::SharedObjects,
};

pub const HTTP_REDIRECT_IRULE: &str = "http_redirect_irule";
pub const HTTPS_REDIRECT_DG: &str = "https_redirect_dg";

/// What the TLS engine needs to know about the Ingress being synced.
pub struct TlsContext<'a> {
    pub ing: &'a networking::Ingress,
    pub key: &'a ObjectKey,
    pub ann: &'a IngressAnnotations,
    pub state: TlsState,
    /// secret => its latest copy, `None` if it could not be fetched
    pub secrets: &'a Map<ObjectKey, Option<core::Secret>>,
    pub events: &'a dyn EventRecorder,
}

impl TlsContext<'_> {
    fn warn_event(&self, reason: &str, message: String) {
        self.events.record(self.ing, EventType::Warning, reason, message);
    }
}

/// Ingress paths served over https: `namespace/service` => `(host, path)`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ServiceFwdRuleMap(Map<String, Set<(String, String)>>);

impl ServiceFwdRuleMap {
    pub fn add(&mut self, namespace: &str, service: &str, host: &str, path: &str) {
        let key = format!("{namespace}/{service}");
        let entry = self.0.entry(key).or_default();
        entry.insert((host.to_string(), path.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        (self.0.iter()).flat_map(|(svc, paths)| {
            (paths.iter()).map(move |(host, path)| (svc.as_str(), host.as_str(), path.as_str()))
        })
    }

    /// Writes the entries as `host + path` => `namespace/service` records.
    pub fn apply(&self, dg: &mut InternalDataGroup) -> bool {
        let mut changed = false;
        for (svc, host, path) in self.entries() {
            let name = format!("{host}{path}");
            if dg.records.get(&name).map(String::as_str) != Some(svc) {
                dg.records.insert(name, svc.to_string());
                changed = true;
            }
        }
        changed
    }
}

/// iRules and profiles an Ingress attaches to one virtual.
#[derive(Default)]
struct Attached {
    irules: Set<String>,
    profiles: Set<ProfileRef>,
}

impl Attached {
    fn profile(&mut self, cfg: &mut ResourceConfig, profile: ProfileRef) {
        cfg.virtual_server.add_or_update_profile(profile.clone());
        self.profiles.insert(profile);
    }

    fn irule(&mut self, cfg: &mut ResourceConfig, name: String) {
        cfg.virtual_server.add_irule(name.clone());
        self.irules.insert(name);
    }
}

/// Applies the TLS settings of `ctx` to the virtual `cfg` listening on `port`. What the
/// Ingress attached on a previous sync and no longer needs is detached.
///
/// Returns whether a secret-backed profile was created or updated.
pub fn apply(
    cfg: &mut ResourceConfig,
    shared: &mut SharedObjects,
    ctx: &TlsContext,
    port: VirtualPort,
    fwd: &mut ServiceFwdRuleMap,
) -> bool {
    let mut attached = Attached::default();
    let mut updated = false;

    // nothing to attach in pool-only mode
    if ctx.state != TlsState::NoTls && !cfg.virtual_server.bind_addr().is_empty() {
        match (port.protocol, ctx.state) {
            (Protocol::Https, _) => updated = https_profiles(cfg, shared, ctx, &mut attached),
            (Protocol::Http, TlsState::Redirect) => {
                http_redirect(cfg, shared, ctx, fwd, &mut attached)
            }
            (Protocol::Http, TlsState::Both) => {
                debug!("{}: serving both http and https", ctx.key)
            }
            (Protocol::Http, TlsState::HttpsOnly | TlsState::NoTls) => {}
        }
    }

    cfg.set_tls_attachments(ctx.key, attached.irules, attached.profiles);
    updated
}

fn https_profiles(
    cfg: &mut ResourceConfig,
    shared: &mut SharedObjects,
    ctx: &TlsContext,
    attached: &mut Attached,
) -> bool {
    let namespace = ctx.key.namespace.as_str();
    let mut updated = false;

    if let Some(profiles) = ctx.ann.client_ssl.as_ref() {
        // malformed annotations were already reported, leaving `profiles` empty
        for profile in profiles {
            let profile = ProfileRef::parse(profile, ProfileContext::Client, namespace);
            attached.profile(cfg, profile);
        }
    } else {
        let tls = (ctx.ing.spec.as_ref()).and_then(|s| s.tls.as_ref());
        let secret_names = tls.into_iter().flatten().filter_map(|t| t.secret_name.as_deref());

        for secret_name in secret_names {
            let secret_key = ObjectKey::new(namespace, secret_name);
            let profile = ProfileRef {
                context: ProfileContext::Client,
                partition: cfg.virtual_server.partition.clone(),
                name: secret_name.to_string(),
                namespace: Some(namespace.to_string()),
            };

            let Some(Some(secret)) = ctx.secrets.get(&secret_key) else {
                let msg = format!("no secret {secret_name} in namespace {namespace}");
                error!("{}: {msg}", ctx.key);
                ctx.warn_event(reasons::SECRET_NOT_FOUND, msg);
                continue;
            };

            let custom = match custom_profile(cfg, secret_name, namespace, secret) {
                Ok(custom) => custom,
                Err(e) => {
                    warn!("{}: secret {secret_key}: {e}", ctx.key);
                    continue;
                }
            };
            if shared.custom_profiles.get(&secret_key) != Some(&custom) {
                shared.custom_profiles.insert(secret_key, custom);
                updated = true;
            }
            attached.profile(cfg, profile);
        }
    }

    if let Some(server_ssl) = ctx.ann.server_ssl.as_deref() {
        let profile = ProfileRef::parse(server_ssl, ProfileContext::Server, namespace);
        attached.profile(cfg, profile);
    }

    updated
}

/// Client profile from a `kubernetes.io/tls` secret, once its certificate and key parse.
fn custom_profile(
    cfg: &ResourceConfig,
    name: &str,
    namespace: &str,
    secret: &core::Secret,
) -> eyre::Result<CustomProfile> {
    let data = secret.data.as_ref();
    let get = |key: &str| {
        data.and_then(|d| d.get(key))
            .map(|v| v.0.as_slice())
            .ok_or_else(|| eyre::format_err!("no {key}"))
    };
    let cert = get("tls.crt")?;
    let key = get("tls.key")?;

    X509::from_pem(cert).map_err(|e| eyre::format_err!("invalid certificate: {e}"))?;
    PKey::private_key_from_pem(key).map_err(|e| eyre::format_err!("invalid key: {e}"))?;

    Ok(CustomProfile {
        name: name.to_string(),
        partition: cfg.virtual_server.partition.clone(),
        namespace: namespace.to_string(),
        context: ProfileContext::Client,
        cert: String::from_utf8_lossy(cert).into_owned(),
        key: String::from_utf8_lossy(key).into_owned(),
    })
}

fn http_redirect(
    cfg: &mut ResourceConfig,
    shared: &mut SharedObjects,
    ctx: &TlsContext,
    fwd: &mut ServiceFwdRuleMap,
    attached: &mut Attached,
) {
    let https_port = ctx.ann.https_port;
    debug!("{}: redirecting http to https port {https_port}", ctx.key);

    let name = format!("{HTTP_REDIRECT_IRULE}_{https_port}");
    let full_name = join_path(COMMON_PARTITION, &name);
    (shared.irules).entry(full_name.clone()).or_insert_with(|| IRule {
        name,
        partition: COMMON_PARTITION.into(),
        code: redirect_irule_code(https_port),
    });
    (shared.internal_datagroups)
        .entry(join_path(COMMON_PARTITION, HTTPS_REDIRECT_DG))
        .or_insert_with(|| InternalDataGroup {
            name: HTTPS_REDIRECT_DG.into(),
            partition: COMMON_PARTITION.into(),
            records: Map::new(),
        });
    attached.irule(cfg, full_name);

    let namespace = ctx.key.namespace.as_str();
    let Some(spec) = ctx.ing.spec.as_ref() else {
        return;
    };
    if let Some(backend) = spec.default_backend.as_ref().and_then(Backend::from_backend) {
        fwd.add(namespace, &backend.service, "*", "/");
    }
    for rule in spec.rules.iter().flatten() {
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        let host = rule.host.as_deref().unwrap_or_default();
        for path in &http.paths {
            let Some(backend) = Backend::from_backend(&path.backend) else {
                continue;
            };
            let path = path.path.as_deref().unwrap_or_default();
            fwd.add(namespace, &backend.service, host, path);
        }
    }
}

/// Writes the collected paths into the redirect datagroup.
pub fn apply_fwd_rules(shared: &mut SharedObjects, fwd: &ServiceFwdRuleMap) -> bool {
    if fwd.is_empty() {
        return false;
    }
    let name = join_path(COMMON_PARTITION, HTTPS_REDIRECT_DG);
    let Some(dg) = shared.internal_datagroups.get_mut(&name) else {
        return false;
    };
    fwd.apply(dg)
}

fn redirect_irule_code(https_port: i32) -> String {
    let authority = match https_port {
        443 => "[getfield [HTTP::host] \":\" 1]".to_string(),
        port => format!("[getfield [HTTP::host] \":\" 1]:{port}"),
    };
    format!(
        r#"when HTTP_REQUEST {{
    # paths served over https, as "host/path" => "namespace/service"
    set host [string tolower [getfield [HTTP::host] ":" 1]]
    set path [HTTP::path]
    if {{ [class match $host$path starts_with {HTTPS_REDIRECT_DG}] or
          [class match "*$path" starts_with {HTTPS_REDIRECT_DG}] }} {{
        HTTP::redirect https://{authority}[HTTP::uri]
    }}
}}"#
    )
}

#[cfg(test)]
mod test;
