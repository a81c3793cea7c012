//! Conservative static scan for the timeframes a strategy source references
//! (spec.md §4.8 step 4).

use std::collections::BTreeSet;

use regex::Regex;

/// Matches `tf: "1h"` / `tf:"1h"` literal occurrences; anything dynamic
/// (string concatenation, variables) is intentionally invisible to this
/// scan — it is a syntactic heuristic, not an interpreter.
fn tf_pattern() -> Regex {
    Regex::new(r#"tf\s*:\s*"([^"]+)""#).expect("static regex")
}

/// Returns the distinct timeframe literals found in `source`, or `{"1m"}`
/// if none are found.
pub fn required_timeframes(source: &str) -> BTreeSet<String> {
    let re = tf_pattern();
    let found: BTreeSet<String> = re
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .collect();
    if found.is_empty() {
        let mut default = BTreeSet::new();
        default.insert("1m".to_string());
        default
    } else {
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_one_minute_when_absent() {
        let tfs = required_timeframes("EMA({length: 20})");
        assert_eq!(tfs.into_iter().collect::<Vec<_>>(), vec!["1m".to_string()]);
    }

    #[test]
    fn collects_distinct_literal_timeframes() {
        let tfs = required_timeframes(r#"EMA({tf: "1h", length: 20}); RSI({tf: "1h", period: 14}); ATR({tf: "4h", period: 14})"#);
        assert_eq!(
            tfs.into_iter().collect::<Vec<_>>(),
            vec!["1h".to_string(), "4h".to_string()]
        );
    }
}
