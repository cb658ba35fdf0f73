//! Rule → search-engine bool query. Third emitter of the compiler, used by
//! aggregation recovery to re-derive today's per-user aggregates from the
//! event-log indices. Same condition vocabulary as the SQL and evaluator
//! paths; `hour` lowers to a script predicate because the engine has no
//! virtual columns.

use serde_json::{json, Value};

use crate::clock::{offset_string, Clock};

use super::{value_str, CondOp, Condition, Logic, Rule};

fn resolve_field(field: &str) -> String {
    if field == "@timestamp" {
        return field.to_string();
    }
    if matches!(field, "msgId" | "hostname" | "eventType" | "severity") {
        return format!("{}.keyword", field);
    }
    format!("cefExtensions.{}.keyword", field)
}

/// sum/cardinality target fields are numeric; no `.keyword` sub-field.
pub fn resolve_agg_field(field: &str) -> String {
    format!("cefExtensions.{}", field)
}

fn script_query(source: String) -> Value {
    json!({ "script": { "script": source } })
}

fn hour_expr(clock: &Clock) -> String {
    format!(
        "doc['@timestamp'].value.withZoneSameInstant(ZoneId.of('{}')).getHour()",
        offset_string(clock.offset())
    )
}

fn hour_clause(cond: &Condition, clock: &Clock) -> Option<Value> {
    let h = hour_expr(clock);
    let v = value_str(&cond.value);
    let clause = match cond.op {
        CondOp::Eq => script_query(format!("{} == {}", h, v)),
        CondOp::Neq => script_query(format!("{} != {}", h, v)),
        CondOp::Gt => script_query(format!("{} > {}", h, v)),
        CondOp::Gte => script_query(format!("{} >= {}", h, v)),
        CondOp::Lt => script_query(format!("{} < {}", h, v)),
        CondOp::Lte => script_query(format!("{} <= {}", h, v)),
        CondOp::In => {
            let vals = serde_json::to_string(&cond.value).ok()?;
            script_query(format!("{}.contains({})", vals, h))
        }
        CondOp::TimeRange => {
            let (start, end) = cond.time_bounds();
            if start > end {
                script_query(format!("{} >= {} || {} < {}", h, start, h, end))
            } else {
                script_query(format!("{} >= {} && {} < {}", h, start, h, end))
            }
        }
        _ => return None,
    };
    Some(clause)
}

pub fn condition_to_clause(cond: &Condition, clock: &Clock) -> Option<Value> {
    if cond.field == "hour" || cond.op == CondOp::TimeRange {
        return hour_clause(cond, clock);
    }
    let field = resolve_field(&cond.field);
    let clause = match cond.op {
        CondOp::Eq => json!({ "term": { field: cond.value } }),
        CondOp::Neq => json!({ "bool": { "must_not": [ { "term": { field: cond.value } } ] } }),
        CondOp::Gt => json!({ "range": { field: { "gt": cond.value } } }),
        CondOp::Gte => json!({ "range": { field: { "gte": cond.value } } }),
        CondOp::Lt => json!({ "range": { field: { "lt": cond.value } } }),
        CondOp::Lte => json!({ "range": { field: { "lte": cond.value } } }),
        CondOp::In => json!({ "terms": { field: cond.value } }),
        CondOp::Contains | CondOp::Like => {
            json!({ "wildcard": { field: format!("*{}*", value_str(&cond.value)) } })
        }
        CondOp::Regex => json!({ "regexp": { field: value_str(&cond.value) } }),
        CondOp::TimeRange => unreachable!(),
    };
    Some(clause)
}

/// Bool query matching today's events that satisfy the rule's match clause.
/// Returns None for rules without a single match clause (multi-pattern rules
/// are CEP-only and have no daily aggregate to recover).
pub fn rule_search_query(rule: &Rule, today: &str, clock: &Clock) -> Option<Value> {
    let m = rule.match_.as_ref()?;
    let tz = offset_string(clock.offset());
    let base = vec![
        json!({ "term": { "msgId.keyword": m.msg_id } }),
        json!({ "range": { "@timestamp": {
            "gte": today, "lt": format!("{}||+1d", today), "time_zone": tz,
        }}}),
    ];

    let clauses: Vec<Value> = m
        .conditions
        .iter()
        .filter_map(|c| condition_to_clause(c, clock))
        .collect();

    if m.logic == Logic::Or && clauses.len() > 1 {
        return Some(json!({
            "bool": {
                "must": base,
                "should": clauses,
                "minimum_should_match": 1,
            }
        }));
    }

    let mut must = base;
    must.extend(clauses);
    Some(json!({ "bool": { "must": must } }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clock() -> Clock {
        Clock::from_tz("Asia/Seoul")
    }

    fn rule(v: serde_json::Value) -> Rule {
        Rule::from_doc("r", &v).unwrap()
    }

    #[test]
    fn basic_bool_query() {
        let r = rule(json!({ "match": { "msgId": "MESSAGE_PROCESS", "conditions": [
            { "field": "act", "op": "eq", "value": "kill" }
        ]}}));
        let q = rule_search_query(&r, "2025-03-01", &clock()).unwrap();
        let must = q["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
        assert_eq!(must[0]["term"]["msgId.keyword"], "MESSAGE_PROCESS");
        assert_eq!(must[1]["range"]["@timestamp"]["lt"], "2025-03-01||+1d");
        assert_eq!(must[2]["term"]["cefExtensions.act.keyword"], "kill");
    }

    #[test]
    fn or_logic_uses_should() {
        let r = rule(json!({ "match": { "msgId": "M", "logic": "or", "conditions": [
            { "field": "a", "op": "eq", "value": "1" },
            { "field": "b", "op": "eq", "value": "2" }
        ]}}));
        let q = rule_search_query(&r, "2025-03-01", &clock()).unwrap();
        assert_eq!(q["bool"]["minimum_should_match"], 1);
        assert_eq!(q["bool"]["should"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn hour_becomes_script() {
        let r = rule(json!({ "match": { "msgId": "M", "conditions": [
            { "field": "hour", "op": "gte", "value": 22 }
        ]}}));
        let q = rule_search_query(&r, "2025-03-01", &clock()).unwrap();
        let script = q["bool"]["must"][2]["script"]["script"].as_str().unwrap();
        assert!(script.contains("ZoneId.of('+09:00')"));
        assert!(script.ends_with(">= 22"));
    }
}
