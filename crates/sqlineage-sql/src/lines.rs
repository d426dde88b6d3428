//! Source line lookup for CTE definitions and the final SELECT

use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};

/// Key of the final SELECT in a line map
pub const FINAL_SELECT: &str = "final_select";

/// Line-map key of a CTE
pub fn cte_key(name: &str) -> String {
    format!("cte:{}", name)
}

/// Map `cte:<name>` and `final_select` to 1-based source lines.
///
/// A CTE is located by the first line containing `<name> AS (` (or `<name> AS`
/// at end of line). The final SELECT is the first line starting with `SELECT`
/// outside any parentheses, after the last CTE definition.
pub fn find_line_numbers(sql: &str, cte_names: &[String]) -> IndexMap<String, usize> {
    let mut found = IndexMap::new();

    let patterns: Vec<(&String, Regex)> = cte_names
        .iter()
        .filter_map(|name| {
            let pattern = format!(r"\b{}\s+AS\s*(\(|$)", regex::escape(name));
            match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                Ok(re) => Some((name, re)),
                Err(err) => {
                    tracing::debug!(cte = %name, error = %err, "skipping line lookup");
                    None
                }
            }
        })
        .collect();

    let mut depth: i64 = 0;
    let mut last_cte_line = 0;
    let mut final_select = None;

    for (index, line) in sql.lines().enumerate() {
        let number = index + 1;

        for (name, re) in &patterns {
            let key = cte_key(name);
            if !found.contains_key(&key) && re.is_match(line) {
                found.insert(key, number);
                last_cte_line = number;
            }
        }

        let starts_select = line
            .trim_start()
            .get(..6)
            .is_some_and(|head| head.eq_ignore_ascii_case("select"));
        let all_ctes_seen = found.len() == patterns.len();

        if final_select.is_none() && starts_select && depth <= 0 && all_ctes_seen && number > last_cte_line {
            final_select = Some(number);
        }

        depth += paren_balance(line);
    }

    if let Some(line) = final_select {
        found.insert(FINAL_SELECT.to_string(), line);
    }
    found
}

/// Opening minus closing parentheses outside string literals
fn paren_balance(line: &str) -> i64 {
    let mut balance = 0;
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => balance += 1,
            ')' if !quoted => balance -= 1,
            _ => {}
        }
    }
    balance
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn locates_ctes_and_final_select() {
        let sql = "WITH step1 AS (\n  SELECT amount FROM orders\n),\nstep2 AS (\n  SELECT amount * 1.1 AS adjusted\n  FROM step1\n)\nSELECT adjusted\nFROM step2";
        let lines = find_line_numbers(sql, &["step1".to_string(), "step2".to_string()]);

        assert_eq!(lines.get("cte:step1"), Some(&1));
        assert_eq!(lines.get("cte:step2"), Some(&4));
        assert_eq!(lines.get(FINAL_SELECT), Some(&8));
    }

    #[test]
    fn select_without_ctes() {
        let lines = find_line_numbers("\n  select id\n  from users", &[]);
        assert_eq!(lines.get(FINAL_SELECT), Some(&2));
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn cte_name_on_its_own_line() {
        let sql = "WITH totals AS\n(\n  SELECT 1 AS x\n)\nSELECT x FROM totals";
        let lines = find_line_numbers(sql, &["totals".to_string()]);

        assert_eq!(lines.get("cte:totals"), Some(&1));
        assert_eq!(lines.get(FINAL_SELECT), Some(&5));
    }

    #[test]
    fn single_line_query_has_no_final_select_after_cte() {
        let lines = find_line_numbers("WITH a AS (SELECT 1 AS x) SELECT x FROM a", &["a".to_string()]);
        assert_eq!(lines.get("cte:a"), Some(&1));
        assert_eq!(lines.get(FINAL_SELECT), None);
    }
}
