// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for query normalization and compilation.
// Run with: cargo +nightly fuzz run fuzz_query_params
//
// The input is split into key=value lines and fed through the normalizer,
// the filter parser and the compiler. Every stage must reject bad input
// with an error; none may panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;
use tablegate_query::{
    Accountability, Compiler, CompilerConfig, PermissionRule, RawQuery, SchemaCatalog,
};

struct Snapshots {
    catalog: SchemaCatalog,
    rules: Vec<PermissionRule>,
    reviewer: Accountability,
    config: CompilerConfig,
}

fn snapshots() -> &'static Snapshots {
    static SNAPSHOTS: OnceLock<Snapshots> = OnceLock::new();
    SNAPSHOTS.get_or_init(|| Snapshots {
        catalog: SchemaCatalog::from_json(include_str!("../../tablegate-query/tests/fixtures/grants_schema.json"))
            .expect("fixture schema"),
        rules: PermissionRule::list_from_json(include_str!(
            "../../tablegate-query/tests/fixtures/grants_permissions.json"
        ))
        .expect("fixture rules"),
        reviewer: Accountability::new(Some("6f1c2a7e-3b4d-4e5f-8a9b-0c1d2e3f4a5b"), &["reviewer"]),
        config: CompilerConfig::default(),
    })
}

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    // Limit input size to prevent timeouts on extremely long strings
    if input.len() > 4096 {
        return;
    }
    let s = snapshots();
    let compiler = Compiler::new(&s.catalog, &s.rules, &s.reviewer, &s.config);

    // Raw filter JSON straight into the parser.
    if let Ok(json) = serde_json::from_str(input) {
        let _ = compiler.normalizer().parse_filter(&json);
    }

    // key=value lines as query parameters.
    let pairs = input.lines().filter_map(|line| line.split_once('='));
    let raw = RawQuery::from_pairs(pairs);
    for collection in ["grants", "applications", "ngos"] {
        if let Ok(plan) = compiler.compile_raw(collection, &raw) {
            let _ = plan.to_sql();
        }
    }
});
