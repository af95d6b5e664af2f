use super::*;

fn draft(uri: &str) -> Rule {
    create_rule(uri, "/k8s/pool", format!("rule-{uri}")).unwrap()
}

fn uris_by_ordinal(rules: &[Rule]) -> Vec<(usize, &str)> {
    let mut v: Vec<_> = rules.iter().map(|r| (r.ordinal, r.full_uri.as_str())).collect();
    v.sort();
    v
}

#[test]
fn test_create_rule_conditions() {
    let rule = draft("foo.com/a/b");
    assert_eq!(
        vec![
            Condition {
                subject: MatchSubject::HttpHost,
                operator: MatchOperator::Equals,
                values: vec!["foo.com".into()],
            },
            Condition {
                subject: MatchSubject::PathSegment(1),
                operator: MatchOperator::Equals,
                values: vec!["a".into()],
            },
            Condition {
                subject: MatchSubject::PathSegment(2),
                operator: MatchOperator::Equals,
                values: vec!["b".into()],
            },
        ],
        rule.conditions
    );
    assert_eq!(
        vec![Action::Forward {
            pool: "/k8s/pool".into()
        }],
        rule.actions
    );

    let rule = draft("*.foo.com/");
    assert_eq!(MatchOperator::EndsWith, rule.conditions[0].operator);
    assert_eq!(vec![".foo.com".to_string()], rule.conditions[0].values);
    assert_eq!(1, rule.conditions.len());
}

#[test]
fn test_malformed_patterns() {
    assert_eq!(
        Err(RuleError::InvalidHost("bad host".into())),
        create_rule("bad host/x", "p", "n".into())
    );
    assert_eq!(
        Err(RuleError::InvalidHost("*".into())),
        create_rule("*/x", "p", "n".into())
    );
    assert!(matches!(
        create_rule("foo.com/a b", "p", "n".into()),
        Err(RuleError::InvalidPath(_))
    ));
}

#[test]
fn test_ordinals_literal_then_wildcard() {
    let drafts = vec![
        draft("*.b.com/x"),
        draft("/a"),
        draft("a.com/z"),
        draft("*.a.com/x"),
        draft("/b"),
    ];
    let rules = compile(drafts, vec![], vec![], &[]);
    assert_eq!(
        vec![
            (0, "a.com/z"),
            (1, "/b"),
            (2, "/a"),
            (3, "*.b.com/x"),
            (4, "*.a.com/x"),
        ],
        uris_by_ordinal(&rules)
    );
}

#[test]
fn test_two_paths() {
    let rules = compile(vec![draft("/a"), draft("/b")], vec![], vec![], &[]);
    assert_eq!(vec![(0, "/b"), (1, "/a")], uris_by_ordinal(&rules));
}

#[test]
fn test_last_draft_for_uri_wins() {
    let mut second = draft("/a");
    second.name = "second".into();
    let rules = compile(vec![draft("/a"), second], vec![], vec![], &[]);
    assert_eq!(1, rules.len());
    assert_eq!("second", rules[0].name);
}

#[test]
fn test_injected_rules_follow() {
    let [redirect, forward] = app_root_rules("foo.com", "/home", "/k8s/pool")
        .unwrap()
        .unwrap();
    let rewrite = url_rewrite_rule("foo.com/old", "bar.com/new").unwrap().unwrap();

    let rules = compile(
        vec![draft("*.x.com/"), draft("foo.com/a")],
        vec![redirect, forward],
        vec![rewrite],
        &[],
    );
    let names: Vec<_> = rules.iter().map(|r| (r.ordinal, r.name.as_str())).collect();
    assert_eq!(
        vec![
            (0, "rule-foo.com/a"),
            (1, "rule-*.x.com/"),
            (2, "app-root-redirect-rule-foo.com"),
            (3, "app-root-forward-rule-foo.com_home"),
            (4, "url-rewrite-rule-foo.com_old"),
        ],
        names
    );
    assert!(rules[2..].iter().all(|r| is_annotation_rule(&r.name)));
    assert!(!is_annotation_rule(&rules[0].name));
}

#[test]
fn test_source_ranges_add_one_condition_per_rule() {
    let ranges = vec!["10.0.0.0/8".to_string()];
    let rules = compile(vec![draft("/a"), draft("/b")], vec![], vec![], &ranges);
    assert_eq!(2, rules.len());
    for rule in &rules {
        let last = rule.conditions.last().unwrap();
        assert_eq!(MatchSubject::TcpAddress, last.subject);
        assert_eq!(ranges, last.values);
    }
    assert_eq!(vec![(0, "/b"), (1, "/a")], uris_by_ordinal(&rules));
}

#[test]
fn test_url_rewrite() {
    let rule = url_rewrite_rule("foo.com/old", "bar.com/new").unwrap().unwrap();
    assert_eq!(
        vec![
            Action::ReplaceHost {
                value: "bar.com".into()
            },
            Action::ReplacePath {
                path: "/old".into(),
                value: "/new".into()
            },
        ],
        rule.actions
    );
    assert_eq!("foo.com/old", rule.full_uri);

    // cannot rewrite a host that is not matched
    assert_eq!(None, url_rewrite_rule("/old", "bar.com/new").unwrap());
    assert_eq!(None, url_rewrite_rule("foo.com", "/new").unwrap());
    assert_eq!(None, url_rewrite_rule("foo.com/x", "").unwrap());
}

#[test]
fn test_app_root() {
    let [redirect, forward] = app_root_rules("", "/home", "/k8s/pool").unwrap().unwrap();
    assert_eq!("/", redirect.full_uri);
    assert_eq!(
        vec![Action::Redirect {
            location: "/home".into()
        }],
        redirect.actions
    );
    assert_eq!("/home", forward.full_uri);
    assert_eq!(vec!["/k8s/pool"], forward.forward_pools().collect::<Vec<_>>());

    assert_eq!(None, app_root_rules("foo.com", "home", "p").unwrap());
    assert_eq!(None, app_root_rules("foo.com", "/", "p").unwrap());
}
