//! Rule → in-memory matcher (the UEBA path of the compiler). Evaluates a
//! rule's match clause directly against an event and yields the aggregation
//! delta the scorer should apply.

use serde_json::Value;

use super::{num, try_num, value_str, AggKind, CondOp, Condition, Logic, Rule};
use crate::clock::Clock;

/// Resolve a logical field against an event. Extension fields shadow
/// top-level fields of the same name; `act` doubles as `action`; `hour` and
/// `dayOfWeek` are computed from `@timestamp` in local time.
pub fn field_value(event: &Value, field: &str, clock: &Clock) -> Option<Value> {
    match field {
        "hour" => {
            let ts = event.get("@timestamp")?.as_str()?;
            return clock.hour_of(ts).map(|h| Value::from(h as i64));
        }
        "dayOfWeek" => {
            let ts = event.get("@timestamp")?.as_str()?;
            return clock.day_of_week_of(ts).map(|d| Value::from(d as i64));
        }
        _ => {}
    }

    let ext = event.get("cefExtensions").and_then(|e| e.as_object());
    if let Some(ext) = ext {
        if let Some(v) = ext.get(field) {
            return Some(v.clone());
        }
        if field == "action" {
            if let Some(v) = ext.get("act") {
                return Some(v.clone());
            }
        }
    }
    event.get(field).cloned()
}

/// Numeric comparison preferred when both sides coerce; otherwise rendered
/// string equality (booleans compare against "true"/"false").
pub fn compare_equal(a: &Value, b: &Value) -> bool {
    if let (Some(fa), Some(fb)) = (try_num(a), try_num(b)) {
        return fa == fb;
    }
    value_str(a) == value_str(b)
}

fn contains_ci(haystack: &Value, needle: &Value) -> bool {
    value_str(haystack)
        .to_lowercase()
        .contains(&value_str(needle).to_lowercase())
}

fn in_array(val: &Value, arr: &Value) -> bool {
    arr.as_array()
        .map(|items| items.iter().any(|item| compare_equal(val, item)))
        .unwrap_or(false)
}

pub fn evaluate_condition(event: &Value, cond: &Condition, clock: &Clock) -> bool {
    let Some(field_val) = field_value(event, &cond.field, clock) else {
        return false;
    };
    match cond.op {
        CondOp::Eq => compare_equal(&field_val, &cond.value),
        CondOp::Neq => !compare_equal(&field_val, &cond.value),
        CondOp::Gt | CondOp::Gte | CondOp::Lt | CondOp::Lte => {
            // non-coercible operands never match
            let (Some(a), Some(b)) = (try_num(&field_val), try_num(&cond.value)) else {
                return false;
            };
            match cond.op {
                CondOp::Gt => a > b,
                CondOp::Gte => a >= b,
                CondOp::Lt => a < b,
                _ => a <= b,
            }
        }
        CondOp::In => in_array(&field_val, &cond.value),
        CondOp::Contains | CondOp::Like => contains_ci(&field_val, &cond.value),
        CondOp::Regex => regex::Regex::new(&value_str(&cond.value))
            .map(|re| re.is_match(&value_str(&field_val)))
            .unwrap_or(false),
        CondOp::TimeRange => {
            let h = num(&field_val) as i64;
            let (start, end) = cond.time_bounds();
            if start > end {
                h >= start || h < end
            } else {
                h >= start && h < end
            }
        }
    }
}

/// Logic-combined match of the rule's single match clause against an event.
/// A msgId mismatch short-circuits; an empty condition list matches.
pub fn match_event(event: &Value, rule: &Rule, clock: &Clock) -> bool {
    let Some(m) = &rule.match_ else {
        return false;
    };
    let msg_id = event.get("msgId").and_then(|v| v.as_str()).unwrap_or("");
    if msg_id != m.msg_id {
        return false;
    }
    if m.conditions.is_empty() {
        return true;
    }
    match m.logic {
        Logic::And => m.conditions.iter().all(|c| evaluate_condition(event, c, clock)),
        Logic::Or => m.conditions.iter().any(|c| evaluate_condition(event, c, clock)),
    }
}

/// What a matching event contributes to the rule's daily aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum AggDelta {
    /// +1 per match.
    Count,
    /// + numeric value of the aggregate field.
    Sum(f64),
    /// +1 only if this value is unseen today for the (user, rule) pair.
    Cardinality(String),
}

pub fn aggregation_delta(event: &Value, rule: &Rule, clock: &Clock) -> AggDelta {
    let Some(agg) = &rule.aggregate else {
        return AggDelta::Count;
    };
    let field_val = agg
        .field
        .as_deref()
        .and_then(|f| field_value(event, f, clock));
    match agg.kind {
        AggKind::Count => AggDelta::Count,
        AggKind::Sum => AggDelta::Sum(field_val.as_ref().map(num).unwrap_or(0.0)),
        AggKind::Cardinality => {
            AggDelta::Cardinality(field_val.as_ref().map(value_str).unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clock() -> Clock {
        Clock::from_tz("UTC")
    }

    fn rule(v: serde_json::Value) -> Rule {
        Rule::from_doc("r", &v).unwrap()
    }

    #[test]
    fn msg_id_gate() {
        let r = rule(json!({ "match": { "msgId": "MESSAGE_PROCESS" } }));
        let ev = json!({ "msgId": "MESSAGE_PROCESS", "cefExtensions": {} });
        assert!(match_event(&ev, &r, &clock()));
        let other = json!({ "msgId": "MESSAGE_PRINT" });
        assert!(!match_event(&other, &r, &clock()));
    }

    #[test]
    fn numeric_preferred_equality() {
        let r = rule(json!({ "match": { "msgId": "M", "conditions": [
            { "field": "fsize", "op": "eq", "value": 1024 }
        ]}}));
        // string field value coerces and matches the numeric rule value
        let ev = json!({ "msgId": "M", "cefExtensions": { "fsize": "1024" } });
        assert!(match_event(&ev, &r, &clock()));
    }

    #[test]
    fn non_coercible_ordered_compare_is_false() {
        let c = Condition {
            field: "fsize".into(),
            op: CondOp::Gt,
            value: json!(100),
            start: None,
            end: None,
        };
        let ev = json!({ "cefExtensions": { "fsize": "not-a-number" } });
        assert!(!evaluate_condition(&ev, &c, &clock()));
    }

    #[test]
    fn act_aliases_action() {
        let r = rule(json!({ "match": { "msgId": "M", "conditions": [
            { "field": "action", "op": "eq", "value": "kill" }
        ]}}));
        let ev = json!({ "msgId": "M", "cefExtensions": { "act": "kill" } });
        assert!(match_event(&ev, &r, &clock()));
    }

    #[test]
    fn or_logic_any_condition() {
        let r = rule(json!({ "match": { "msgId": "M", "logic": "or", "conditions": [
            { "field": "act", "op": "eq", "value": "copy" },
            { "field": "act", "op": "eq", "value": "move" }
        ]}}));
        let ev = json!({ "msgId": "M", "cefExtensions": { "act": "move" } });
        assert!(match_event(&ev, &r, &clock()));
        let ev = json!({ "msgId": "M", "cefExtensions": { "act": "kill" } });
        assert!(!match_event(&ev, &r, &clock()));
    }

    #[test]
    fn time_range_wraps() {
        let c = Condition {
            field: "hour".into(),
            op: CondOp::TimeRange,
            value: json!({ "start": 22, "end": 6 }),
            start: None,
            end: None,
        };
        // property: start=22 end=6 matches {22,23,0..5} and nothing else
        for h in 0..24 {
            let ev = json!({ "@timestamp": format!("2025-03-01T{:02}:15:00+00:00", h) });
            let expect = h >= 22 || h < 6;
            assert_eq!(evaluate_condition(&ev, &c, &clock()), expect, "hour {}", h);
        }
    }

    #[test]
    fn aggregation_deltas() {
        let sum_rule = rule(json!({
            "match": { "msgId": "M" },
            "aggregate": { "type": "sum", "field": "fsize" }
        }));
        let ev = json!({ "msgId": "M", "cefExtensions": { "fsize": "2048" } });
        assert_eq!(aggregation_delta(&ev, &sum_rule, &clock()), AggDelta::Sum(2048.0));

        let card_rule = rule(json!({
            "match": { "msgId": "M" },
            "aggregate": { "type": "cardinality", "field": "fname" }
        }));
        let ev = json!({ "msgId": "M", "cefExtensions": { "fname": "a.doc" } });
        assert_eq!(
            aggregation_delta(&ev, &card_rule, &clock()),
            AggDelta::Cardinality("a.doc".into())
        );
    }
}
