//! Traffic matching rules: construction from `host/path` patterns, annotation driven
//! rewrite rules, and ordinal assignment.

use std::collections::BTreeMap as Map;

use crate::model::{Action, Condition, MatchOperator, MatchSubject, Rule};

const URL_REWRITE_PREFIX: &str = "url-rewrite";
const APP_ROOT_PREFIX: &str = "app-root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    InvalidHost(String),
    InvalidPath(String),
}
impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHost(h) => write!(f, "invalid host {h:?}"),
            Self::InvalidPath(p) => write!(f, "invalid path {p:?}"),
        }
    }
}
impl std::error::Error for RuleError {}

/// Rules injected by the url-rewrite and app-root annotations.
pub fn is_annotation_rule(name: &str) -> bool {
    name.starts_with(URL_REWRITE_PREFIX) || name.starts_with(APP_ROOT_PREFIX)
}

/// Splits `host/path` at the first `/`. The path keeps its leading `/`.
pub fn split_uri(uri: &str) -> (&str, &str) {
    match uri.find('/') {
        Some(pos) => uri.split_at(pos),
        None => (uri, ""),
    }
}

/// Builds the rule forwarding `uri` (`host/path`, host may be `*.domain`) to `pool`.
pub fn create_rule(uri: &str, pool: &str, name: String) -> Result<Rule, RuleError> {
    let (host, path) = split_uri(uri);
    let mut conditions = host_conditions(host)?;
    conditions.extend(path_conditions(path)?);

    Ok(Rule {
        name,
        full_uri: uri.to_string(),
        ordinal: 0,
        conditions,
        actions: vec![Action::Forward {
            pool: pool.to_string(),
        }],
    })
}

fn host_conditions(host: &str) -> Result<Vec<Condition>, RuleError> {
    if host.is_empty() {
        return Ok(vec![]);
    }
    let (operator, value) = match host.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => (MatchOperator::EndsWith, suffix),
        _ => (MatchOperator::Equals, host),
    };

    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':');
    if value.is_empty() || !value.chars().all(valid_char) {
        return Err(RuleError::InvalidHost(host.to_string()));
    }

    Ok(vec![Condition {
        subject: MatchSubject::HttpHost,
        operator,
        values: vec![value.to_string()],
    }])
}

/// One condition per non-empty segment of `path`.
fn path_conditions(path: &str) -> Result<Vec<Condition>, RuleError> {
    let invalid = |c: char| c.is_whitespace() || c.is_control() || matches!(c, '?' | '#');
    if path.chars().any(invalid) {
        return Err(RuleError::InvalidPath(path.to_string()));
    }

    Ok((path.split('/').filter(|s| !s.is_empty()).enumerate())
        .map(|(i, segment)| Condition {
            subject: MatchSubject::PathSegment(i + 1),
            operator: MatchOperator::Equals,
            values: vec![segment.to_string()],
        })
        .collect())
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        })
        .collect()
}

/// Rule rewriting requests for `target` (`host/path`) to `value` (`host/path`).
///
/// A host (or path) can only be rewritten when the target names one.
pub fn url_rewrite_rule(target: &str, value: &str) -> Result<Option<Rule>, RuleError> {
    if value.is_empty() {
        return Ok(None);
    }
    let (target_host, target_path) = split_uri(target);
    let (value_host, value_path) = split_uri(value);

    if (target_host.is_empty() && !value_host.is_empty())
        || (target_path.is_empty() && !value_path.is_empty())
    {
        return Ok(None);
    }

    let mut actions = Vec::new();
    if !value_host.is_empty() {
        actions.push(Action::ReplaceHost {
            value: value_host.to_string(),
        });
    }
    if !value_path.is_empty() {
        actions.push(Action::ReplacePath {
            path: target_path.to_string(),
            value: value_path.to_string(),
        });
    }
    if actions.is_empty() {
        return Ok(None);
    }

    let mut conditions = host_conditions(target_host)?;
    conditions.extend(path_conditions(target_path)?);

    Ok(Some(Rule {
        name: format!("{URL_REWRITE_PREFIX}-rule-{}", sanitize(target)),
        full_uri: target.to_string(),
        ordinal: 0,
        conditions,
        actions,
    }))
}

/// Redirects `host/` to `root`, and forwards `host<root>` to `pool`.
pub fn app_root_rules(host: &str, root: &str, pool: &str) -> Result<Option<[Rule; 2]>, RuleError> {
    if !root.starts_with('/') || root == "/" {
        return Ok(None);
    }

    let mut redirect_conditions = host_conditions(host)?;
    redirect_conditions.push(Condition {
        subject: MatchSubject::HttpPath,
        operator: MatchOperator::Equals,
        values: vec!["/".into()],
    });
    let redirect = Rule {
        name: format!("{APP_ROOT_PREFIX}-redirect-rule-{}", sanitize(host)),
        full_uri: format!("{host}/"),
        ordinal: 0,
        conditions: redirect_conditions,
        actions: vec![Action::Redirect {
            location: root.to_string(),
        }],
    };

    let mut forward_conditions = host_conditions(host)?;
    forward_conditions.extend(path_conditions(root)?);
    let forward = Rule {
        name: format!(
            "{APP_ROOT_PREFIX}-forward-rule-{}{}",
            sanitize(host),
            sanitize(root)
        ),
        full_uri: format!("{host}{root}"),
        ordinal: 0,
        conditions: forward_conditions,
        actions: vec![Action::Forward {
            pool: pool.to_string(),
        }],
    };

    Ok(Some([redirect, forward]))
}

/// Orders draft rules and assigns their ordinals.
///
/// Literal rules come first, then wildcard (`*.`) ones, each bucket by descending full URI
/// (the last draft for a given URI wins). App-root then url-rewrite rules follow in the
/// order they were built. Source ranges become one extra condition on every rule.
pub fn compile(
    drafts: Vec<Rule>,
    app_root: Vec<Rule>,
    url_rewrite: Vec<Rule>,
    source_ranges: &[String],
) -> Vec<Rule> {
    let mut literal = Map::new();
    let mut wildcard = Map::new();
    for rule in drafts {
        let bucket = if rule.full_uri.starts_with("*.") {
            &mut wildcard
        } else {
            &mut literal
        };
        bucket.insert(rule.full_uri.clone(), rule);
    }

    let mut rules: Vec<Rule> = (literal.into_values().rev())
        .chain(wildcard.into_values().rev())
        .chain(app_root)
        .chain(url_rewrite)
        .collect();

    for (ordinal, rule) in rules.iter_mut().enumerate() {
        rule.ordinal = ordinal;
    }

    if !source_ranges.is_empty() {
        // a separate rule would let non-matching clients fall through to the next one
        for rule in &mut rules {
            rule.conditions.push(Condition {
                subject: MatchSubject::TcpAddress,
                operator: MatchOperator::Matches,
                values: source_ranges.to_vec(),
            });
        }
    }

    rules
}

#[cfg(test)]
mod test;
