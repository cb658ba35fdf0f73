//! The same condition vocabulary lowers three ways (streaming SQL, in-memory
//! evaluation, search bool queries). These tests pin the evaluator's verdict
//! and the other emitters' clause text side by side for each operator, so a
//! drift in any one lowering fails here.

use serde_json::{json, Value};
use siem_analytics_engine::clock::Clock;
use siem_analytics_engine::rules::{eval, query, sql, Rule};

fn clock() -> Clock {
    Clock::from_tz("UTC")
}

fn rule(conditions: Value) -> Rule {
    Rule::from_doc(
        "r",
        &json!({ "match": { "msgId": "M", "conditions": conditions } }),
    )
    .unwrap()
}

fn event(ext: Value) -> Value {
    json!({
        "msgId": "M",
        "@timestamp": "2025-03-01T23:30:00+00:00",
        "hostname": "h1",
        "cefExtensions": ext
    })
}

struct Case {
    cond: Value,
    matching: Value,
    non_matching: Value,
    sql_clause: &'static str,
}

#[test]
fn operators_agree_across_emitters() {
    let cases = vec![
        Case {
            cond: json!({ "field": "act", "op": "eq", "value": "kill" }),
            matching: json!({ "act": "kill" }),
            non_matching: json!({ "act": "open" }),
            sql_clause: "cefExtensions['act'] = 'kill'",
        },
        Case {
            cond: json!({ "field": "act", "op": "neq", "value": "kill" }),
            matching: json!({ "act": "open" }),
            non_matching: json!({ "act": "kill" }),
            sql_clause: "cefExtensions['act'] != 'kill'",
        },
        Case {
            cond: json!({ "field": "fsize", "op": "gt", "value": 1024 }),
            matching: json!({ "fsize": "2048" }),
            non_matching: json!({ "fsize": "512" }),
            sql_clause: "CAST(cefExtensions['fsize'] AS DOUBLE) > 1024",
        },
        Case {
            cond: json!({ "field": "fsize", "op": "lte", "value": 100 }),
            matching: json!({ "fsize": 100 }),
            non_matching: json!({ "fsize": 101 }),
            sql_clause: "CAST(cefExtensions['fsize'] AS DOUBLE) <= 100",
        },
        Case {
            cond: json!({ "field": "proto", "op": "in", "value": ["tcp", "udp"] }),
            matching: json!({ "proto": "udp" }),
            non_matching: json!({ "proto": "icmp" }),
            sql_clause: "cefExtensions['proto'] IN ('tcp','udp')",
        },
        Case {
            cond: json!({ "field": "fname", "op": "contains", "value": "Secret" }),
            matching: json!({ "fname": "top-SECRET-plan.doc" }),
            non_matching: json!({ "fname": "notes.txt" }),
            // contains has no SQL lowering; the msgId filter remains
            sql_clause: "msgId = 'M'",
        },
        Case {
            cond: json!({ "field": "hour", "op": "time_range", "start": 22, "end": 6 }),
            // event timestamp is 23:30 UTC
            matching: json!({}),
            non_matching: json!({}),
            sql_clause: "(HOUR(proctime) >= 22 OR HOUR(proctime) < 6)",
        },
    ];

    for case in cases {
        let r = rule(json!([case.cond]));

        // SQL emitter carries the expected clause
        let compiled = sql::build_sql(&r);
        assert!(
            compiled.contains(case.sql_clause),
            "SQL for {:?} missing `{}`: {}",
            case.cond,
            case.sql_clause,
            compiled
        );

        // evaluator verdicts
        let ev = event(case.matching.clone());
        assert!(
            eval::match_event(&ev, &r, &clock()),
            "evaluator rejected matching event for {:?}",
            case.cond
        );
        if case.cond["op"] != "time_range" {
            let ev = event(case.non_matching.clone());
            assert!(
                !eval::match_event(&ev, &r, &clock()),
                "evaluator accepted non-matching event for {:?}",
                case.cond
            );
        }

        // search emitter produces a bool query with the same gate
        let q = query::rule_search_query(&r, "2025-03-01", &clock()).unwrap();
        assert_eq!(q["bool"]["must"][0]["term"]["msgId.keyword"], "M");
    }
}

#[test]
fn time_range_non_wrapping_window() {
    let r = rule(json!([
        { "field": "hour", "op": "time_range", "start": 9, "end": 18 }
    ]));
    // 23:30 is outside working hours
    assert!(!eval::match_event(&event(json!({})), &r, &clock()));
    let compiled = sql::build_sql(&r);
    assert!(compiled.contains("(HOUR(proctime) >= 9 AND HOUR(proctime) < 18)"));
}

#[test]
fn legacy_conditions_shape_compiles() {
    let r = Rule::from_doc(
        "legacy",
        &json!({ "conditions": [
            { "field": "msgId", "op": "eq", "value": "MESSAGE_DRM" },
            { "field": "outcome", "op": "eq", "value": "blocked" }
        ]}),
    )
    .unwrap();
    let compiled = sql::build_sql(&r);
    assert!(compiled.contains("msgId = 'MESSAGE_DRM'"));
    assert!(compiled.contains("cefExtensions['outcome'] = 'blocked'"));
}
