//! Builds the draft configuration one Ingress wants on one virtual port.

use k8s_openapi::api::networking::v1 as networking;
use log::{debug, error, warn};
use std::collections::BTreeSet as Set;

use crate::{
    Backend, ControllerConfig, ObjectKey,
    annotations::{self, IngressAnnotations},
    cluster::ObjectIndex,
    format_pool_name, format_rule_name, format_vs_name, join_path,
    model::{Pool, Rule},
    rules::{self, RuleError},
};

/// Pools and rules one Ingress contributes to one virtual.
#[derive(Debug, Clone)]
pub struct Draft {
    pub ingress: ObjectKey,
    pub virtual_name: String,
    pub partition: String,
    /// empty in pool-only mode
    pub bind_addr: String,
    pub port: i32,
    pub pools: Vec<Pool>,
    /// compiled rules; `None` when no policy is wanted
    pub rules: Option<Vec<Rule>>,
    pub single_service: bool,
    /// carries app-root or url-rewrite rules
    pub injected: bool,
}

/// The address the Ingress' virtuals bind to, empty for pool-only mode.
pub fn bind_address(ann: &IngressAnnotations, config: &ControllerConfig) -> String {
    match ann.bind_addr.as_deref() {
        Some(annotations::CONTROLLER_DEFAULT) => config.default_ingress_ip.clone(),
        Some(addr) => addr.to_string(),
        None if !matches!(config.default_ingress_ip.as_str(), "" | "0.0.0.0") => {
            config.default_ingress_ip.clone()
        }
        None => {
            error!(
                "no ingress IP address: configure --default-ingress-ip or annotate the Ingress with {}",
                annotations::BIND_ADDR
            );
            String::new()
        }
    }
}

pub fn is_single_service(ing: &networking::Ingress) -> bool {
    (ing.spec.as_ref()).is_none_or(|spec| spec.rules.is_none())
}

pub fn synthesize(
    ing: &networking::Ingress,
    key: &ObjectKey,
    ann: &IngressAnnotations,
    port: i32,
    bind_addr: &str,
    config: &ControllerConfig,
    index: &dyn ObjectIndex,
) -> Result<Option<Draft>, RuleError> {
    let partition = (ann.partition.clone()).unwrap_or_else(|| config.partition.clone());
    let mut draft = Draft {
        ingress: key.clone(),
        virtual_name: format_vs_name(bind_addr, port),
        partition,
        bind_addr: bind_addr.to_string(),
        port,
        pools: Vec::new(),
        rules: None,
        single_service: is_single_service(ing),
        injected: false,
    };

    let Some(spec) = ing.spec.as_ref() else {
        warn!("{key}: no spec");
        return Ok(None);
    };

    if draft.single_service {
        let Some(backend) = spec.default_backend.as_ref().and_then(Backend::from_backend) else {
            warn!("{key}: single-service Ingress without a usable default backend");
            return Ok(None);
        };
        single_service(&mut draft, ann, backend)?;
    } else {
        multi_service(&mut draft, spec, ann, index)?;
    }

    Ok(Some(draft))
}

fn new_pool(draft: &Draft, ann: &IngressAnnotations, backend: Backend) -> Pool {
    Pool {
        name: format_pool_name(&draft.ingress.namespace, &backend.service, &backend.port),
        partition: draft.partition.clone(),
        balance: ann.balance.clone(),
        service_name: backend.service,
        service_port: backend.port,
        monitor_names: Vec::new(),
    }
}

fn single_service(
    draft: &mut Draft,
    ann: &IngressAnnotations,
    backend: Backend,
) -> Result<(), RuleError> {
    let pool = new_pool(draft, ann, backend);
    let pool_path = pool.full_name();
    draft.pools.push(pool);

    if ann.url_rewrite.is_some() {
        warn!(
            "{}: url-rewrite is not supported on single-service Ingresses, ignored",
            draft.ingress
        );
    }

    let Some(app_root) = ann.app_root.as_ref() else {
        return Ok(());
    };
    if app_root.len() > 1 {
        warn!(
            "{}: single-service Ingresses support only one app-root value, ignored",
            draft.ingress
        );
        return Ok(());
    }
    let Some(root) = app_root.get(annotations::SINGLE_TARGET) else {
        warn!(
            "{}: single-service Ingresses do not support targeted app-root values, ignored",
            draft.ingress
        );
        return Ok(());
    };

    if let Some(pair) = rules::app_root_rules("", root, &pool_path)? {
        draft.rules = Some(rules::compile(vec![], pair.into(), vec![], &[]));
        draft.injected = true;
    }
    Ok(())
}

fn multi_service(
    draft: &mut Draft,
    spec: &networking::IngressSpec,
    ann: &IngressAnnotations,
    index: &dyn ObjectIndex,
) -> Result<(), RuleError> {
    let namespace = draft.ingress.namespace.clone();
    let paths = || {
        (spec.rules.iter().flatten())
            .filter_map(|rule| {
                let http = rule.http.as_ref()?;
                Some((rule.host.as_deref().unwrap_or_default(), http))
            })
            .flat_map(|(host, http)| http.paths.iter().map(move |path| (host, path)))
    };

    for (_, path) in paths() {
        let Some(backend) = Backend::from_backend(&path.backend) else {
            continue;
        };
        let name = format_pool_name(&namespace, &backend.service, &backend.port);
        if draft.pools.iter().any(|p| p.name == name) {
            continue;
        }
        if index.service(&namespace, &backend.service).is_none() {
            debug!("{}: service {namespace}/{} not found", draft.ingress, backend.service);
            continue;
        }
        let pool = new_pool(draft, ann, backend);
        draft.pools.push(pool);
    }

    let mut drafts = Vec::new();
    let mut url_rewrite = Vec::new();
    let mut app_root = Vec::new();
    let mut app_root_hosts = Set::new();

    for (host, path) in paths() {
        let Some(backend) = Backend::from_backend(&path.backend) else {
            continue;
        };
        let pool_name = format_pool_name(&namespace, &backend.service, &backend.port);
        if !draft.pools.iter().any(|p| p.name == pool_name) {
            continue;
        }
        let pool_path = join_path(&draft.partition, &pool_name);
        let path = path.path.as_deref().unwrap_or_default();
        let uri = format!("{host}{path}");

        let rule_name = format_rule_name(host, path, &pool_name);
        drafts.push(rules::create_rule(&uri, &pool_path, rule_name)?);

        if let Some(value) = ann.url_rewrite.as_ref().and_then(|m| m.get(&uri)) {
            if let Some(rule) = rules::url_rewrite_rule(&uri, value)? {
                if !url_rewrite.iter().any(|r: &Rule| r.name == rule.name) {
                    url_rewrite.push(rule);
                }
            }
        }

        // one app-root pair per host, towards the host's first pool
        let root = ann.app_root.as_ref().and_then(|m| m.get(host));
        if let Some(root) = root.filter(|_| !app_root_hosts.contains(host)) {
            if let Some(pair) = rules::app_root_rules(host, root, &pool_path)? {
                app_root_hosts.insert(host);
                app_root.extend(pair);
            }
        }
    }

    draft.injected = !url_rewrite.is_empty() || !app_root.is_empty();
    draft.rules = Some(rules::compile(drafts, app_root, url_rewrite, &ann.source_ranges));
    Ok(())
}
