//! Rule → streaming SQL. Compilation is pure and deterministic; the output
//! runs as a continuous INSERT against the `events` table of the SQL
//! gateway session.
//!
//! Shapes:
//!   1. single pattern        — direct filter
//!   2. aggregate/quantifier  — TUMBLE window with HAVING
//!   3. ordered patterns      — MATCH_RECOGNIZE
//!   4. unordered, logic=OR   — disjunction of stage filters
//!   5. unordered, logic=AND  — per-stage presence flags in a TUMBLE window

use once_cell::sync::Lazy;
use regex::Regex;

use super::{value_str, CondOp, Condition, Logic, MatchClause, Pattern, Rule};

static WINDOW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)([smh])$").unwrap());

/// String literals are neutralized before they reach the gateway: quotes and
/// backslashes doubled, statement separators and line comments stripped.
pub fn escape_sql_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "''")
        .replace(';', "")
        .replace("--", "")
}

fn is_base_field(field: &str) -> bool {
    matches!(field, "msgId" | "hostname" | "userId" | "userName" | "userIp")
}

fn resolve_field(field: &str) -> String {
    match field {
        "hour" | "time" => "HOUR(proctime)".to_string(),
        "dayOfWeek" => "DAYOFWEEK(proctime)".to_string(),
        f if is_base_field(f) => f.to_string(),
        other => format!("cefExtensions['{}']", escape_sql_value(other)),
    }
}

/// `"Ns" | "Nm" | "Nh"` → `INTERVAL 'N' SECOND|MINUTE|HOUR`. Anything else
/// falls back to five minutes.
pub fn parse_window(window: Option<&str>) -> String {
    let Some(s) = window else {
        return "INTERVAL '5' MINUTE".to_string();
    };
    match WINDOW_RE.captures(s.trim()) {
        Some(caps) => {
            let unit = match &caps[2] {
                "s" => "SECOND",
                "m" => "MINUTE",
                _ => "HOUR",
            };
            format!("INTERVAL '{}' {}", &caps[1], unit)
        }
        None => "INTERVAL '5' MINUTE".to_string(),
    }
}

pub fn condition_clause(c: &Condition) -> String {
    let field = resolve_field(&c.field);
    match c.op {
        CondOp::Eq => format!("{} = '{}'", field, escape_sql_value(&value_str(&c.value))),
        CondOp::Neq => format!("{} != '{}'", field, escape_sql_value(&value_str(&c.value))),
        CondOp::Gt => format!("CAST({} AS DOUBLE) > {}", field, value_str(&c.value)),
        CondOp::Gte => format!("CAST({} AS DOUBLE) >= {}", field, value_str(&c.value)),
        CondOp::Lt => format!("CAST({} AS DOUBLE) < {}", field, value_str(&c.value)),
        CondOp::Lte => format!("CAST({} AS DOUBLE) <= {}", field, value_str(&c.value)),
        CondOp::In => {
            let items = c
                .value
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .map(|v| format!("'{}'", escape_sql_value(&value_str(v))))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            format!("{} IN ({})", field, items)
        }
        CondOp::Like => format!("{} LIKE '{}'", field, escape_sql_value(&value_str(&c.value))),
        CondOp::Regex => format!("REGEXP({}, '{}')", field, escape_sql_value(&value_str(&c.value))),
        // `contains` has no SQL lowering; evaluator-only.
        CondOp::Contains => String::new(),
        CondOp::TimeRange => {
            let (start, end) = c.time_bounds();
            if start > end {
                format!("(HOUR(proctime) >= {} OR HOUR(proctime) < {})", start, end)
            } else {
                format!("(HOUR(proctime) >= {} AND HOUR(proctime) < {})", start, end)
            }
        }
    }
}

pub fn match_where(m: &MatchClause) -> String {
    let mut clauses = Vec::new();
    if !m.msg_id.is_empty() {
        clauses.push(format!("msgId = '{}'", escape_sql_value(&m.msg_id)));
    }

    let cond_clauses: Vec<String> = m
        .conditions
        .iter()
        .map(condition_clause)
        .filter(|c| !c.is_empty())
        .collect();
    match cond_clauses.len() {
        0 => {}
        1 => clauses.push(cond_clauses.into_iter().next().unwrap()),
        _ => {
            let joiner = match m.logic {
                Logic::And => " AND ",
                Logic::Or => " OR ",
            };
            clauses.push(format!("({})", cond_clauses.join(joiner)));
        }
    }

    if clauses.is_empty() {
        "1=1".to_string()
    } else {
        clauses.join(" AND ")
    }
}

/// Compile a rule into the SELECT feeding its alert INSERT. An empty rule
/// compiles to a query that matches nothing.
pub fn build_sql(rule: &Rule) -> String {
    let patterns = rule.normalized_patterns();
    if patterns.is_empty() {
        return "SELECT * FROM events WHERE 1=0".to_string();
    }

    let by_fields = rule.by_fields();
    let select_fields = format!("{}, hostname, userIp", by_fields.join(", "));
    let group_fields = select_fields.clone();

    if patterns.len() == 1 {
        return build_single(rule, &patterns[0], &select_fields, &group_fields);
    }

    if patterns.iter().any(|p| p.order.is_some()) {
        return build_match_recognize(rule, &patterns, &by_fields);
    }

    // unordered multi-pattern
    let stage_wheres: Vec<String> = patterns
        .iter()
        .map(|p| format!("({})", match_where(&p.match_)))
        .collect();

    if rule.top_logic() == Logic::Or {
        return format!(
            "SELECT {}, 1 as cnt FROM events WHERE {}",
            select_fields,
            stage_wheres.join(" OR ")
        );
    }

    let interval = parse_window(Some(rule.within.as_deref().unwrap_or("30m")));
    let mut flags = Vec::new();
    let mut having = Vec::new();
    for (i, p) in patterns.iter().enumerate() {
        flags.push(format!(
            "MAX(CASE WHEN {} THEN 1 ELSE 0 END) AS p{}",
            match_where(&p.match_),
            i
        ));
        having.push(format!("p{} = 1", i));
    }
    format!(
        "SELECT {}, {}, COUNT(*) as cnt FROM events WHERE {} \
         GROUP BY TUMBLE(proctime, {}), {} HAVING {}",
        select_fields,
        flags.join(", "),
        stage_wheres.join(" OR "),
        interval,
        group_fields,
        having.join(" AND ")
    )
}

fn build_single(rule: &Rule, p: &Pattern, select_fields: &str, group_fields: &str) -> String {
    let where_ = match_where(&p.match_);

    if let Some(agg) = &rule.aggregate {
        let interval = parse_window(Some(agg.within.as_deref().unwrap_or("1h")));
        return format!(
            "SELECT {}, COUNT(*) as cnt FROM events WHERE {} \
             GROUP BY TUMBLE(proctime, {}), {} HAVING COUNT(*) >= {}",
            select_fields,
            where_,
            interval,
            group_fields,
            agg.effective_min()
        );
    }

    let min_q = p.quantifier.map(|q| q.min).unwrap_or(0);
    if min_q > 1 {
        let interval = parse_window(Some(rule.within.as_deref().unwrap_or("1h")));
        return format!(
            "SELECT {}, COUNT(*) as cnt FROM events WHERE {} \
             GROUP BY TUMBLE(proctime, {}), {} HAVING COUNT(*) >= {}",
            select_fields, where_, interval, group_fields, min_q
        );
    }

    format!("SELECT {}, 1 as cnt FROM events WHERE {}", select_fields, where_)
}

fn build_match_recognize(rule: &Rule, patterns: &[Pattern], by_fields: &[String]) -> String {
    let mut ordered: Vec<&Pattern> = patterns.iter().filter(|p| p.order.is_some()).collect();
    ordered.sort_by_key(|p| p.order.unwrap_or(0));

    let mut stages = Vec::new();
    let mut defines = Vec::new();
    for p in &ordered {
        let pid = format!("P{}", p.order.unwrap_or(0));
        defines.push(format!("{} AS {}", pid, match_where(&p.match_)));

        let (min_q, max_q) = p
            .quantifier
            .map(|q| (q.min.max(1), q.max))
            .unwrap_or((1, 0));
        if min_q > 1 {
            if max_q > 0 {
                stages.push(format!("{}{{{},{}}}", pid, min_q, max_q));
            } else {
                stages.push(format!("{}{{{},}}", pid, min_q));
            }
        } else {
            stages.push(pid);
        }
    }

    let interval = parse_window(Some(rule.within.as_deref().unwrap_or("5m")));
    format!(
        "SELECT * FROM events\nMATCH_RECOGNIZE (\n\
         \x20 PARTITION BY {}\n\
         \x20 ORDER BY proctime\n\
         \x20 MEASURES\n\
         \x20   LAST(hostname) AS hostname,\n\
         \x20   LAST(userIp) AS userIp,\n\
         \x20   COUNT(*) AS cnt\n\
         \x20 ONE ROW PER MATCH\n\
         \x20 AFTER MATCH SKIP PAST LAST ROW\n\
         \x20 PATTERN ({}) WITHIN {}\n\
         \x20 DEFINE\n\
         \x20   {}\n)",
        by_fields.join(", "),
        stages.join(" "),
        interval,
        defines.join(", ")
    )
}

/// Wrap a compiled SELECT in the alert INSERT. The literal columns carry the
/// rule identity so the alert consumer needs no rule lookup.
pub fn build_insert(rule_id: &str, rule_name: &str, severity: &str, select_sql: &str) -> String {
    let flat = select_sql.replace('\n', " ");
    let name = escape_sql_value(rule_name);
    let id = escape_sql_value(rule_id);
    let sev = escape_sql_value(severity);
    if select_sql.to_uppercase().contains("MATCH_RECOGNIZE") {
        format!(
            "INSERT INTO alerts SELECT '{}', '{}', '{}', userId, hostname, userIp, cnt, CURRENT_TIMESTAMP FROM ({})",
            id, name, sev, flat
        )
    } else {
        format!(
            "INSERT INTO alerts SELECT '{}', '{}', '{}', userId, hostname, userIp, cnt, CURRENT_TIMESTAMP FROM ({}) AS t",
            id, name, sev, flat
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(v: serde_json::Value) -> Rule {
        Rule::from_doc("r1", &v).unwrap()
    }

    #[test]
    fn simple_filter_shape() {
        let sql = build_sql(&rule(json!({
            "match": { "msgId": "MESSAGE_PROCESS", "conditions": [
                { "field": "act", "op": "eq", "value": "kill" }
            ]}
        })));
        assert_eq!(
            sql,
            "SELECT userId, hostname, userIp, 1 as cnt FROM events \
             WHERE msgId = 'MESSAGE_PROCESS' AND cefExtensions['act'] = 'kill'"
        );
    }

    #[test]
    fn window_parse_units_and_fallback() {
        assert_eq!(parse_window(Some("30s")), "INTERVAL '30' SECOND");
        assert_eq!(parse_window(Some("5m")), "INTERVAL '5' MINUTE");
        assert_eq!(parse_window(Some("2h")), "INTERVAL '2' HOUR");
        assert_eq!(parse_window(Some("bogus")), "INTERVAL '5' MINUTE");
        assert_eq!(parse_window(None), "INTERVAL '5' MINUTE");
    }

    #[test]
    fn escaping_strips_injection() {
        let sql = build_sql(&rule(json!({
            "match": { "msgId": "M'; DROP TABLE events; --", "conditions": [] }
        })));
        assert!(!sql.contains(';'));
        assert!(!sql.contains("--"));
        assert!(sql.contains("M'' DROP TABLE events"));
    }

    #[test]
    fn time_range_wraps_midnight() {
        let c = Condition {
            field: "h".into(),
            op: CondOp::TimeRange,
            value: json!({ "start": 22, "end": 6 }),
            start: None,
            end: None,
        };
        assert_eq!(
            condition_clause(&c),
            "(HOUR(proctime) >= 22 OR HOUR(proctime) < 6)"
        );
    }
}
