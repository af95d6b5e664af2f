//! Binds the health monitors declared on an Ingress to the pools serving their paths.

use k8s_openapi::api::networking::v1 as networking;
use kube::runtime::events::EventType;
use log::warn;
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::{
    Backend, ObjectKey, PortRef, join_path,
    annotations::HealthMonitorSpec,
    cluster::{EventRecorder, reasons},
    model::{Monitor, MonitorBinding, ResourceConfig},
};

const WILDCARD_HOST: &str = "*";
const DEFAULT_MONITOR_TYPE: &str = "http";

/// An Ingress path, and the monitor declared for it if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleData {
    pub service: String,
    pub port: PortRef,
    pub monitor: Option<HealthMonitorSpec>,
    pub assigned: bool,
    /// pools the monitor was bound to
    pub bindings: Set<MonitorBinding>,
}

/// host => path => rule data
pub type HostToPathMap = Map<String, Map<String, RuleData>>;

pub struct MonitorContext<'a> {
    pub ing: &'a networking::Ingress,
    pub key: &'a ObjectKey,
    pub events: &'a dyn EventRecorder,
}

impl MonitorContext<'_> {
    fn warn(&self, reason: &str, msg: String) {
        warn!("{}: {msg}", self.key);
        self.events.record(self.ing, EventType::Warning, reason, msg);
    }
}

fn rule_data(backend: Backend) -> RuleData {
    RuleData {
        service: backend.service,
        port: backend.port,
        monitor: None,
        assigned: false,
        bindings: Set::new(),
    }
}

/// A single-service Ingress serves every host and path.
pub fn single_service_paths(ing: &networking::Ingress) -> HostToPathMap {
    let backend = (ing.spec.as_ref())
        .and_then(|s| s.default_backend.as_ref())
        .and_then(Backend::from_backend);
    let mut map = HostToPathMap::new();
    if let Some(backend) = backend {
        let paths = map.entry(WILDCARD_HOST.to_string()).or_default();
        paths.insert("/".to_string(), rule_data(backend));
    }
    map
}

pub fn multi_service_paths(ctx: &MonitorContext) -> HostToPathMap {
    let mut map = HostToPathMap::new();
    let rules = (ctx.ing.spec.as_ref()).and_then(|s| s.rules.as_ref());

    for rule in rules.into_iter().flatten() {
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        let host = match rule.host.as_deref() {
            None | Some("") => WILDCARD_HOST,
            Some(host) => host,
        };
        let paths = map.entry(host.to_string()).or_default();

        for path in &http.paths {
            let path_key = match path.path.as_deref() {
                None | Some("") => "/",
                Some(p) => p,
            };
            if paths.contains_key(path_key) {
                let msg = format!("health monitor path {path_key} already exists for host {host}");
                ctx.warn(reasons::DUPLICATE_PATH, msg);
                continue;
            }
            let Some(backend) = Backend::from_backend(&path.backend) else {
                continue;
            };
            paths.insert(path_key.to_string(), rule_data(backend));
        }
    }

    if map.contains_key(WILDCARD_HOST) {
        for host in map.keys().filter(|h| *h != WILDCARD_HOST) {
            let msg = format!("health monitor rule for host {host} conflicts with rule for all hosts");
            ctx.warn(reasons::DUPLICATE_PATH, msg);
        }
    }

    map
}

/// Attaches each monitor to the entry of its `host/path`, falling back to the wildcard host.
pub fn assign_monitors(map: &mut HostToPathMap, monitors: &[HealthMonitorSpec], ctx: &MonitorContext) {
    for monitor in monitors {
        let Some(slash) = monitor.path.find('/') else {
            let msg = format!("health monitor path {:?} is not valid", monitor.path);
            ctx.warn(reasons::MONITOR_RULE_NOT_FOUND, msg);
            continue;
        };
        let (host, path) = monitor.path.split_at(slash);

        let host = if map.contains_key(host) {
            host
        } else if host != WILDCARD_HOST && map.contains_key(WILDCARD_HOST) {
            WILDCARD_HOST
        } else {
            let msg = format!("rule not found for health monitor host {host}");
            ctx.warn(reasons::MONITOR_RULE_NOT_FOUND, msg);
            continue;
        };

        let Some(data) = map.get_mut(host).and_then(|paths| paths.get_mut(path)) else {
            let msg = format!("rule not found for health monitor path {}", monitor.path);
            ctx.warn(reasons::MONITOR_RULE_NOT_FOUND, msg);
            continue;
        };
        data.monitor = Some(monitor.clone());
    }
}

/// Records the monitors `ingress` bound through `map`. The ones it bound before are dropped
/// unless another Ingress still binds them.
pub fn record_bindings(cfg: &mut ResourceConfig, ingress: &ObjectKey, map: &HostToPathMap) {
    let bindings = (map.values().flat_map(|paths| paths.values()))
        .flat_map(|data| data.bindings.iter().cloned())
        .collect();
    cfg.set_monitor_bindings(ingress, bindings);
}

fn assign_monitor_to_pool(cfg: &mut ResourceConfig, pool_path: &str, data: &mut RuleData) -> bool {
    let Some(spec) = data.monitor.as_ref() else {
        return false;
    };
    let Some(idx) = cfg.pool_by_path(pool_path) else {
        return false;
    };
    let pool = &cfg.pools[idx];
    let type_ = spec.type_.as_deref().unwrap_or(DEFAULT_MONITOR_TYPE);
    let monitor = Monitor {
        name: format!("{}_0_{type_}", pool.name),
        partition: pool.partition.clone(),
        type_: type_.to_string(),
        interval: spec.interval,
        timeout: spec.timeout,
        send: spec.send.clone(),
        recv: spec.recv.clone(),
    };
    data.assigned = true;
    (data.bindings).insert((pool.name.clone(), join_path(&monitor.partition, &monitor.name)));
    cfg.set_monitor(idx, monitor)
}

/// Binds the single-service entries to the virtual's pool. Returns whether a monitor changed.
pub fn bind_single_service(cfg: &mut ResourceConfig, pool_path: &str, map: &mut HostToPathMap) -> bool {
    let mut updated = false;
    for data in map.values_mut().flat_map(|paths| paths.values_mut()) {
        updated |= assign_monitor_to_pool(cfg, pool_path, data);
    }
    updated
}

/// Binds each entry to the pools its matching rules forward to.
pub fn bind_multi_service(cfg: &mut ResourceConfig, map: &mut HostToPathMap) -> bool {
    let mut updated = false;
    for (host, paths) in map.iter_mut() {
        for (path, data) in paths.iter_mut() {
            if data.monitor.is_none() {
                continue;
            }
            let Some(policy) = cfg.policy() else {
                continue;
            };
            let pools: Vec<String> = (policy.rules.iter())
                .filter(|rule| {
                    let (rule_host, rule_path) = rule.host_path();
                    (host == WILDCARD_HOST || host == rule_host) && path == rule_path
                })
                .flat_map(|rule| rule.forward_pools().map(String::from))
                .collect();
            for pool in pools {
                updated |= assign_monitor_to_pool(cfg, &pool, data);
            }
        }
    }
    updated
}

/// Reports declared monitors that matched no rule.
pub fn notify_unused(map: &HostToPathMap, ctx: &MonitorContext) {
    let unused = (map.values().flat_map(|paths| paths.values()))
        .filter(|data| !data.assigned)
        .filter_map(|data| data.monitor.as_ref());
    for monitor in unused {
        let msg = format!(
            "health monitor path {} does not match any Ingress paths",
            monitor.path
        );
        ctx.events.record(ctx.ing, EventType::Normal, reasons::MONITOR_RULE_NOT_USED, msg);
    }
}
