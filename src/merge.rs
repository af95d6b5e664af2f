//! Merging drafts into shared virtuals, and withdrawing them.
//!
//! Several Ingresses may bind the same address and port. Each one's pools and rules are
//! upserted into the virtual's configuration, and what each Ingress put there is tracked
//! in [`MetaData::contributions`] so a later sync or a deletion withdraws exactly that.

use log::{debug, info, warn};
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::{
    ObjectKey,
    model::{
        Action, Contribution, MetaData, Policy, RESOURCE_TYPE_INGRESS, ResourceConfig, Rule,
        SourceAddressTranslation, Virtual,
    },
    rules::is_annotation_rule,
    store::{MergedRule, Resources},
    synth::Draft,
};

/// Whether `draft` may not join `existing`: single-service virtuals are never shared
/// between Ingresses.
pub fn conflicts(existing: &ResourceConfig, draft: &Draft) -> bool {
    (!existing.virtual_server.pool_name.is_empty() || draft.single_service)
        && existing.meta.ingress != draft.ingress
        && !existing.virtual_server.bind_addr().is_empty()
}

/// Merges `draft` into the store. Returns the virtual's name, or `None` if the draft was
/// refused (the store is then untouched) or left the virtual without pools (it is then
/// deleted).
pub fn merge(resources: &mut Resources, draft: Draft, snat_pool_name: &str) -> Option<String> {
    if let Some(existing) = resources.get(&draft.virtual_name) {
        if conflicts(existing, &draft) {
            let addr = existing.virtual_server.address.as_ref();
            warn!(
                "{}: single-service Ingress cannot share {}:{} with {}",
                draft.ingress,
                addr.map_or("", |a| a.bind_addr.as_str()),
                draft.port,
                existing.meta.ingress
            );
            return None;
        }
    }

    let Draft {
        ingress,
        virtual_name,
        partition,
        bind_addr,
        port,
        pools,
        rules,
        single_service,
        injected,
    } = draft;

    let Resources { configs, shared } = resources;
    let registry = shared.merged_rules.entry(virtual_name.clone()).or_default();

    let cfg = configs.entry(virtual_name.clone()).or_insert_with(|| {
        if bind_addr.is_empty() {
            info!("no virtual address for {virtual_name}, creating pools only");
        }
        new_config(&virtual_name, &partition, &bind_addr, port, &ingress, snat_pool_name)
    });

    // attachments stay until TLS and monitors are applied to this virtual again
    let previous = cfg.meta.contributions.get(&ingress);
    let contribution = Contribution {
        single_service,
        pools: pools.iter().map(|p| p.name.clone()).collect(),
        rules: rules.iter().flatten().map(|r| r.name.clone()).collect(),
        irules: previous.map(|c| c.irules.clone()).unwrap_or_default(),
        profiles: previous.map(|c| c.profiles.clone()).unwrap_or_default(),
        monitors: previous.map(|c| c.monitors.clone()).unwrap_or_default(),
    };
    if let Some(previous) = cfg.meta.contributions.insert(ingress.clone(), contribution) {
        release(cfg, &previous, registry);
    }

    for pool in pools {
        match cfg.pools.iter_mut().find(|p| p.name == pool.name) {
            Some(existing) => {
                if existing.balance != pool.balance {
                    existing.balance = pool.balance;
                }
            }
            None => cfg.pools.push(pool),
        }
    }

    if let Some(rules) = rules {
        match cfg.policy_mut() {
            Some(policy) => {
                for rule in rules {
                    upsert_rule(policy, rule);
                }
            }
            None => cfg.set_policy(Policy::new(virtual_name.clone(), partition, rules)),
        }
    }

    if single_service {
        cfg.meta.ingress = ingress;
    }
    refresh_default_pool(cfg);

    if injected || !registry.is_empty() {
        merge_injected_rules(cfg, registry);
    }
    cfg.sort_rules();

    if cfg.pools.is_empty() {
        info!("no pool left on {virtual_name}, removing it");
        configs.remove(&virtual_name);
        shared.merged_rules.remove(&virtual_name);
        return None;
    }

    Some(virtual_name)
}

fn new_config(
    name: &str,
    partition: &str,
    bind_addr: &str,
    port: i32,
    ingress: &ObjectKey,
    snat_pool_name: &str,
) -> ResourceConfig {
    let mut virtual_server = Virtual::new(name.to_string(), partition.to_string());
    virtual_server.enabled = true;
    virtual_server.set_http_profiles();
    virtual_server.source_address_translation =
        SourceAddressTranslation::for_snat_pool(snat_pool_name);
    virtual_server.set_address(bind_addr, port);

    ResourceConfig {
        virtual_server,
        pools: Vec::new(),
        policies: Vec::new(),
        monitors: Vec::new(),
        meta: MetaData {
            resource_type: RESOURCE_TYPE_INGRESS.into(),
            ingress: ingress.clone(),
            contributions: Map::new(),
        },
    }
}

/// Replaces the rule with the same name (or, between plain rules, the same URI) keeping its
/// ordinal, or appends it.
fn upsert_rule(policy: &mut Policy, mut rule: Rule) {
    let same = |r: &Rule| {
        r.name == rule.name
            || (!is_annotation_rule(&r.name)
                && !is_annotation_rule(&rule.name)
                && r.full_uri == rule.full_uri)
    };
    match policy.rules.iter_mut().find(|r| same(r)) {
        Some(existing) => {
            rule.ordinal = existing.ordinal;
            *existing = rule;
        }
        None => {
            rule.ordinal = policy.rules.len();
            policy.rules.push(rule);
        }
    }
}

/// The virtual's default pool is set only while it has exactly one pool, coming from a
/// single-service Ingress.
fn refresh_default_pool(cfg: &mut ResourceConfig) {
    let pool_name = match &cfg.pools[..] {
        [pool] if (cfg.meta.contributions.values())
            .any(|c| c.single_service && c.pools.contains(&pool.name)) =>
        {
            pool.full_name()
        }
        _ => String::new(),
    };
    if cfg.virtual_server.pool_name != pool_name {
        debug!("{}: default pool {pool_name:?}", cfg.name());
        cfg.virtual_server.pool_name = pool_name;
    }
}

/// Drops what `previous` contributed and nobody references anymore.
fn release(cfg: &mut ResourceConfig, previous: &Contribution, registry: &mut Map<String, MergedRule>) {
    cfg.detach_irules(&previous.irules);
    cfg.detach_profiles(&previous.profiles);
    cfg.detach_monitors(&previous.monitors);

    let stale_pools: Set<&String> = (previous.pools.iter())
        .filter(|name| !cfg.meta.references_pool(name))
        .collect();
    let stale_rules: Set<&String> = (previous.rules.iter())
        .filter(|name| !cfg.meta.references_rule(name))
        .collect();
    if stale_pools.is_empty() && stale_rules.is_empty() {
        return;
    }

    cfg.pools.retain(|p| !stale_pools.contains(&p.name));
    cfg.prune_monitors();

    let released: Vec<MergedRule> = (stale_rules.iter())
        .filter_map(|name| registry.remove(name.as_str()))
        .collect();

    let Some(policy) = cfg.policy_mut() else {
        return;
    };
    policy.rules.retain(|r| !stale_rules.contains(&r.name));
    for merged in released {
        let Some(target) = policy.rules.iter_mut().find(|r| r.name == merged.merged_with) else {
            continue;
        };
        (target.actions).retain(|a| {
            matches!(a, Action::Forward { .. }) || !merged.rule.actions.contains(a)
        });
    }
    policy.compact_ordinals();
}

/// Folds injected rules into the plain rule matching the same URI, and re-applies the
/// folds recorded for this virtual.
fn merge_injected_rules(cfg: &mut ResourceConfig, registry: &mut Map<String, MergedRule>) {
    let Some(policy) = cfg.policy_mut() else {
        registry.clear();
        return;
    };

    let mut folded = Set::new();
    for rule in policy.rules.iter().filter(|r| is_annotation_rule(&r.name)) {
        let target = (policy.rules.iter())
            .find(|t| !is_annotation_rule(&t.name) && t.full_uri == rule.full_uri);
        let Some(target) = target else {
            continue;
        };
        registry.insert(
            rule.name.clone(),
            MergedRule {
                rule: rule.clone(),
                merged_with: target.name.clone(),
            },
        );
        folded.insert(rule.name.clone());
    }
    policy.rules.retain(|r| !folded.contains(&r.name));

    registry.retain(|_, merged| policy.rules.iter().any(|r| r.name == merged.merged_with));
    for merged in registry.values() {
        let Some(target) = policy.rules.iter_mut().find(|r| r.name == merged.merged_with) else {
            continue;
        };
        for action in &merged.rule.actions {
            if target.actions.contains(action) {
                continue;
            }
            // the target keeps its own pool
            if matches!(action, Action::Forward { .. }) && target.forward_pools().next().is_some() {
                continue;
            }
            target.actions.push(action.clone());
        }
    }

    policy.compact_ordinals();
}

/// Withdraws `ingress` from every virtual not in `keep`. Virtuals left without contributors
/// or pools are deleted. Returns whether anything changed.
pub fn withdraw(resources: &mut Resources, ingress: &ObjectKey, keep: &Set<String>) -> bool {
    let Resources { configs, shared } = resources;
    let mut changed = false;
    let mut emptied = Vec::new();

    for (name, cfg) in configs.iter_mut() {
        if keep.contains(name) {
            continue;
        }
        let Some(previous) = cfg.meta.contributions.remove(ingress) else {
            continue;
        };
        changed = true;
        debug!("{ingress}: withdrawn from {name}");

        let registry = shared.merged_rules.entry(name.clone()).or_default();
        release(cfg, &previous, registry);

        if &cfg.meta.ingress == ingress {
            if let Some(next) = cfg.meta.contributions.keys().next() {
                cfg.meta.ingress = next.clone();
            }
        }
        refresh_default_pool(cfg);
        cfg.sort_rules();

        if cfg.meta.contributions.is_empty() || cfg.pools.is_empty() {
            emptied.push(name.clone());
        }
    }

    for name in emptied {
        info!("removing virtual {name}");
        configs.remove(&name);
        shared.merged_rules.remove(&name);
    }
    changed
}

pub fn remove_ingress(resources: &mut Resources, ingress: &ObjectKey) -> bool {
    withdraw(resources, ingress, &Set::new())
}
