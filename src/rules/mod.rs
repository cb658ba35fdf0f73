//! Rule catalogue model and the shared condition vocabulary.
//!
//! A rule document is heterogeneous JSON; this module gives it a typed shape
//! with serde defaults and applies the backward-compat lowerings so that the
//! three emitters (streaming SQL, in-memory evaluator, search bool query)
//! all see the same normalized form.

pub mod eval;
pub mod query;
pub mod sql;
pub mod store;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

// Tolerant of case and of unknown values: a hand-edited document must not
// knock the rule out of the catalogue.
impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = Option::<String>::deserialize(d)?.unwrap_or_default();
        Ok(match s.to_uppercase().as_str() {
            "LOW" => Severity::Low,
            "HIGH" => Severity::High,
            _ => Severity::Medium,
        })
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Logic {
    #[default]
    #[serde(rename = "and", alias = "AND", alias = "And")]
    And,
    #[serde(rename = "or", alias = "OR", alias = "Or")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CondOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    Like,
    Regex,
    TimeRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: CondOp,
    #[serde(default)]
    pub value: Value,
    /// `time_range` bounds may sit on the condition itself or inside `value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Value>,
}

impl Condition {
    pub fn time_bounds(&self) -> (i64, i64) {
        let pick = |direct: &Option<Value>, key: &str| -> i64 {
            direct
                .as_ref()
                .and_then(try_num)
                .or_else(|| self.value.get(key).and_then(try_num))
                .unwrap_or(0.0) as i64
        };
        (pick(&self.start, "start"), pick(&self.end, "end"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchClause {
    #[serde(rename = "msgId", default)]
    pub msg_id: String,
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Quantifier {
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(rename = "match")]
    pub match_: MatchClause,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantifier: Option<Quantifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggKind {
    #[default]
    Count,
    Sum,
    Cardinality,
}

// An absent or empty `type` means count.
fn agg_kind_compat<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<AggKind, D::Error> {
    let s = Option::<String>::deserialize(d)?.unwrap_or_default();
    Ok(match s.as_str() {
        "sum" => AggKind::Sum,
        "cardinality" => AggKind::Cardinality,
        _ => AggKind::Count,
    })
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CountSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aggregate {
    #[serde(rename = "type", default, deserialize_with = "agg_kind_compat")]
    pub kind: AggKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(rename = "minCount", default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<CountSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
}

impl Aggregate {
    /// `count.min` wins over the legacy `minCount` spelling.
    pub fn effective_min(&self) -> i64 {
        self.count
            .and_then(|c| c.min)
            .or(self.min_count)
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngineToggle {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cep: EngineToggle,
    #[serde(default)]
    pub ueba: EngineToggle,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_: Option<MatchClause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<Pattern>,
    /// Legacy shape: `events[]` carrying msgId + conditions per stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<MatchClause>,
    /// Legacy shape: bare conditions with the msgId among them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<Logic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
    #[serde(rename = "jobId", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(rename = "jobStatus", default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl Rule {
    /// Parse a rule document; the document id becomes the rule id and the
    /// fallback name.
    pub fn from_doc(id: &str, doc: &Value) -> Option<Rule> {
        let mut rule: Rule = serde_json::from_value(doc.clone()).ok()?;
        rule.id = id.to_string();
        if rule.name.is_empty() {
            rule.name = id.to_string();
        }
        Some(rule)
    }

    pub fn by_fields(&self) -> Vec<String> {
        if self.by.is_empty() {
            vec!["userId".to_string()]
        } else {
            self.by.clone()
        }
    }

    pub fn top_logic(&self) -> Logic {
        self.logic.unwrap_or_default()
    }

    /// Backward-compat lowering to the canonical `patterns[]` form:
    /// `events[]` become ordered stages, a bare `match` becomes a single
    /// stage, and bare `conditions[]` become a single stage with the `msgId`
    /// condition hoisted out.
    pub fn normalized_patterns(&self) -> Vec<Pattern> {
        if !self.patterns.is_empty() {
            return self.patterns.clone();
        }
        if !self.events.is_empty() {
            let ordered = self.events.len() > 1;
            return self
                .events
                .iter()
                .enumerate()
                .map(|(i, m)| Pattern {
                    match_: m.clone(),
                    order: ordered.then_some(i as i64 + 1),
                    quantifier: None,
                })
                .collect();
        }
        if let Some(m) = &self.match_ {
            return vec![Pattern {
                match_: m.clone(),
                order: None,
                quantifier: None,
            }];
        }
        if !self.conditions.is_empty() {
            let mut m = MatchClause::default();
            for cond in &self.conditions {
                if cond.field == "msgId" && cond.op == CondOp::Eq {
                    m.msg_id = value_str(&cond.value);
                } else {
                    m.conditions.push(cond.clone());
                }
            }
            return vec![Pattern {
                match_: m,
                order: None,
                quantifier: None,
            }];
        }
        Vec::new()
    }
}

// ── value coercion shared by all emitters ──

/// Numeric coercion: numbers pass through, strings are parsed.
pub fn try_num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn num(v: &Value) -> f64 {
    try_num(v).unwrap_or(0.0)
}

/// Render a JSON scalar the way it appears in rule text: strings unquoted,
/// integral floats without the trailing `.0`.
pub fn value_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f == f.trunc() && f.abs() < 1e15 {
                    return format!("{}", f as i64);
                }
            }
            n.to_string()
        }
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ── rule validation (control plane) ──

const VALID_OPS: &[&str] = &[
    "eq", "neq", "gt", "gte", "lt", "lte", "in", "contains", "like", "regex", "time_range",
];

/// Field-level validation of a raw rule document. Returns one reason per
/// problem; an empty vec means the rule is acceptable.
pub fn validate_rule(doc: &Value) -> Vec<String> {
    let mut errs = Vec::new();

    if doc.get("name").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
        errs.push("name is required".to_string());
    }

    let has_match = doc.get("match").map(|m| m.is_object()).unwrap_or(false);
    let has_patterns = doc
        .get("patterns")
        .and_then(|p| p.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    let has_conditions = doc
        .get("conditions")
        .and_then(|c| c.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    let shapes = [has_match, has_patterns, has_conditions]
        .iter()
        .filter(|b| **b)
        .count();
    if shapes == 0 {
        errs.push("one of match, patterns or conditions is required".to_string());
        return errs;
    }
    if shapes > 1 {
        errs.push("match, patterns and conditions are mutually exclusive".to_string());
    }

    if has_match {
        let m = &doc["match"];
        if m.get("msgId").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
            errs.push("match.msgId is required".to_string());
        }
        if let Some(conds) = m.get("conditions").and_then(|c| c.as_array()) {
            validate_conditions(conds, &mut errs);
        }
    }
    if has_conditions {
        if let Some(conds) = doc.get("conditions").and_then(|c| c.as_array()) {
            validate_conditions(conds, &mut errs);
        }
    }

    if let Some(w) = doc.get("weight") {
        if try_num(w).map(|f| f <= 0.0).unwrap_or(true) {
            errs.push("weight must be a positive number".to_string());
        }
    }

    if let Some(agg) = doc.get("aggregate").and_then(|a| a.as_object()) {
        let kind = agg.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if !kind.is_empty() && !matches!(kind, "count" | "sum" | "cardinality") {
            errs.push(format!(
                "aggregate.type '{}' is invalid (count/sum/cardinality)",
                kind
            ));
        }
        if matches!(kind, "sum" | "cardinality")
            && agg.get("field").and_then(|v| v.as_str()).unwrap_or("").is_empty()
        {
            errs.push(format!("aggregate.type={} requires aggregate.field", kind));
        }
    }

    errs
}

fn validate_conditions(conds: &[Value], errs: &mut Vec<String>) {
    for (i, raw) in conds.iter().enumerate() {
        let Some(c) = raw.as_object() else {
            errs.push(format!("conditions[{}]: not an object", i));
            continue;
        };
        if c.get("field").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
            errs.push(format!("conditions[{}]: field is required", i));
        }
        let op = c.get("op").and_then(|v| v.as_str()).unwrap_or("");
        if !VALID_OPS.contains(&op) {
            errs.push(format!("conditions[{}]: invalid op '{}'", i, op));
            continue;
        }
        if op == "time_range" {
            let bounds = ["start", "end"].map(|k| {
                c.get(k)
                    .or_else(|| c.get("value").and_then(|v| v.get(k)))
                    .and_then(try_num)
            });
            for (k, b) in ["start", "end"].iter().zip(bounds) {
                match b {
                    Some(h) if (0.0..24.0).contains(&h) => {}
                    _ => errs.push(format!("conditions[{}]: {} must be in [0,24)", i, k)),
                }
            }
            continue;
        }
        if !c.contains_key("value") {
            errs.push(format!("conditions[{}]: value is required", i));
            continue;
        }
        if matches!(op, "gt" | "gte" | "lt" | "lte") && try_num(&c["value"]).is_none() {
            errs.push(format!(
                "conditions[{}]: op '{}' requires a numerically coercible value",
                i, op
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rule_defaults() {
        let rule = Rule::from_doc(
            "r1",
            &json!({ "enabled": true, "match": { "msgId": "MESSAGE_PROCESS" } }),
        )
        .unwrap();
        assert_eq!(rule.name, "r1");
        assert_eq!(rule.severity, Severity::Medium);
        assert_eq!(rule.weight, 1.0);
        assert_eq!(rule.by_fields(), vec!["userId".to_string()]);
        assert!(!rule.ueba.enabled);
    }

    #[test]
    fn events_lowering_assigns_order() {
        let rule = Rule::from_doc(
            "r",
            &json!({
                "events": [
                    { "msgId": "A" },
                    { "msgId": "B", "conditions": [{"field": "act", "op": "eq", "value": "x"}] }
                ]
            }),
        )
        .unwrap();
        let pats = rule.normalized_patterns();
        assert_eq!(pats.len(), 2);
        assert_eq!(pats[0].order, Some(1));
        assert_eq!(pats[1].order, Some(2));
        assert_eq!(pats[1].match_.conditions.len(), 1);
    }

    #[test]
    fn bare_conditions_hoist_msg_id() {
        let rule = Rule::from_doc(
            "r",
            &json!({
                "conditions": [
                    { "field": "msgId", "op": "eq", "value": "MESSAGE_PRINT" },
                    { "field": "act", "op": "eq", "value": "print" }
                ]
            }),
        )
        .unwrap();
        let pats = rule.normalized_patterns();
        assert_eq!(pats.len(), 1);
        assert_eq!(pats[0].match_.msg_id, "MESSAGE_PRINT");
        assert_eq!(pats[0].match_.conditions.len(), 1);
    }

    #[test]
    fn min_count_compat() {
        let agg: Aggregate = serde_json::from_value(json!({ "minCount": 3 })).unwrap();
        assert_eq!(agg.effective_min(), 3);
        assert_eq!(agg.kind, AggKind::Count);
        let agg: Aggregate =
            serde_json::from_value(json!({ "count": { "min": 5 }, "minCount": 3 })).unwrap();
        assert_eq!(agg.effective_min(), 5);
    }

    #[test]
    fn validation_reports_reasons() {
        let errs = validate_rule(&json!({ "match": { "msgId": "" } }));
        assert!(errs.iter().any(|e| e.contains("name")));
        assert!(errs.iter().any(|e| e.contains("msgId")));

        let errs = validate_rule(&json!({
            "name": "x",
            "match": { "msgId": "M", "conditions": [
                { "field": "fsize", "op": "gt", "value": "abc" },
                { "field": "h", "op": "time_range", "start": 25, "end": 3 },
                { "field": "a", "op": "nope", "value": 1 }
            ]}
        }));
        assert!(errs.iter().any(|e| e.contains("coercible")));
        assert!(errs.iter().any(|e| e.contains("[0,24)")));
        assert!(errs.iter().any(|e| e.contains("invalid op")));
    }

    #[test]
    fn exactly_one_shape() {
        let errs = validate_rule(&json!({
            "name": "x",
            "match": { "msgId": "M" },
            "patterns": [{ "match": { "msgId": "M" } }]
        }));
        assert!(errs.iter().any(|e| e.contains("mutually exclusive")));
    }

    #[test]
    fn value_str_renders_scalars() {
        assert_eq!(value_str(&json!("kill")), "kill");
        assert_eq!(value_str(&json!(3.0)), "3");
        assert_eq!(value_str(&json!(3.5)), "3.5");
        assert_eq!(value_str(&json!(true)), "true");
    }
}
