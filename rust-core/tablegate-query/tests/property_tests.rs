// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property tests for filter merging and permission narrowing.

use proptest::prelude::*;
use serde_json::{json, Map, Value as JsonValue};
use tablegate_query::{
    merge_filters, merge_rule_filters, Accountability, Compiler, CompilerConfig, FilterNode,
    MergeStrategy, Operator, RawQuery, SchemaCatalog, Value,
};

const FIELDS: [&str; 3] = ["status", "score", "category"];

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        (0i64..5).prop_map(Value::Int),
        prop::sample::select(vec!["a", "b", "c"]).prop_map(|s| Value::String(s.into())),
    ]
}

fn leaf() -> impl Strategy<Value = FilterNode> {
    (
        prop::sample::select(FIELDS.to_vec()),
        prop::sample::select(vec![Operator::Eq, Operator::Neq, Operator::Gt, Operator::Lt]),
        value(),
    )
        .prop_map(|(field, op, v)| FilterNode::compare(field, op, v).unwrap())
}

fn filter() -> impl Strategy<Value = FilterNode> {
    leaf().prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..3).prop_map(FilterNode::And),
            prop::collection::vec(inner.clone(), 1..3).prop_map(FilterNode::Or),
            inner.prop_map(|f| FilterNode::Not(Box::new(f))),
        ]
    })
}

fn record() -> impl Strategy<Value = Map<String, JsonValue>> {
    (0i64..5, prop::sample::select(vec!["a", "b", "c"]), prop::option::of(0i64..5)).prop_map(
        |(status, category, score)| {
            let mut m = Map::new();
            m.insert("status".into(), json!(status));
            m.insert("category".into(), json!(category));
            m.insert("score".into(), score.map_or(JsonValue::Null, |s| json!(s)));
            m
        },
    )
}

proptest! {
    #[test]
    fn merge_with_absent_side_is_identity(f in filter()) {
        for strategy in [MergeStrategy::And, MergeStrategy::Or] {
            prop_assert_eq!(merge_filters(Some(f.clone()), None, strategy), Some(f.clone()));
            prop_assert_eq!(merge_filters(None, Some(f.clone()), strategy), Some(f.clone()));
        }
    }

    #[test]
    fn rule_merge_ignores_rule_order(filters in prop::collection::vec(filter(), 1..5), shift in 0usize..5) {
        let forward = merge_rule_filters(filters.iter().cloned().map(Some));
        let mut rotated = filters.clone();
        rotated.rotate_left(shift % filters.len());
        rotated.reverse();
        prop_assert_eq!(forward, merge_rule_filters(rotated.into_iter().map(Some)));
    }

    #[test]
    fn rule_merge_matches_any_rule(filters in prop::collection::vec(filter(), 1..5), r in record()) {
        let merged = merge_rule_filters(filters.iter().cloned().map(Some)).unwrap();
        prop_assert_eq!(merged.matches(&r), filters.iter().any(|f| f.matches(&r)));
    }

    #[test]
    fn caller_filter_only_narrows(permission in filter(), caller in filter(), r in record()) {
        let scoped = merge_filters(Some(permission.clone()), Some(caller), MergeStrategy::And).unwrap();
        if scoped.matches(&r) {
            prop_assert!(permission.matches(&r));
        }
    }

    #[test]
    fn limit_is_capped(limit in 1u64..3000) {
        let catalog = SchemaCatalog::from_json(include_str!("fixtures/grants_schema.json")).unwrap();
        let acc = Accountability::admin();
        let config = CompilerConfig::default();
        let raw = RawQuery::from_pairs([("limit", limit.to_string())]);
        let result = Compiler::new(&catalog, &[], &acc, &config).compile_raw("grants", &raw);
        if limit <= config.query_limit_max {
            prop_assert_eq!(result.unwrap().limit, Some(limit));
        } else {
            prop_assert_eq!(result.unwrap_err().kind(), "INVALID_QUERY");
        }
    }
}
