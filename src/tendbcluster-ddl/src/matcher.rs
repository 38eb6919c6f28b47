// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Database name patterns.
//!
//! A pattern matches a whole name. `%` matches any run of characters, `?`
//! matches exactly one, and everything else matches itself.

use regex::Regex;

use crate::error::DdlError;

/// Compiles a database name pattern.
pub fn pattern_to_regex(pattern: &str) -> Result<Regex, DdlError> {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| DdlError::InvalidPattern {
        pattern: pattern.into(),
        error: e.to_string(),
    })
}

/// Returns the names in `databases` matched by some pattern in `intention`,
/// by no pattern in `ignore`, and not listed in `system`, preserving the
/// order of `databases`.
pub fn match_databases(
    databases: &[String],
    intention: &[String],
    ignore: &[String],
    system: &[&str],
) -> Result<Vec<String>, DdlError> {
    let compile = |patterns: &[String]| {
        patterns
            .iter()
            .map(|p| pattern_to_regex(p))
            .collect::<Result<Vec<_>, _>>()
    };
    let intention = compile(intention)?;
    let ignore = compile(ignore)?;
    Ok(databases
        .iter()
        .filter(|db| !system.contains(&db.as_str()))
        .filter(|db| intention.iter().any(|re| re.is_match(db)))
        .filter(|db| !ignore.iter().any(|re| re.is_match(db)))
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_wildcards() {
        let re = pattern_to_regex("db%").unwrap();
        assert!(re.is_match("db"));
        assert!(re.is_match("db_1"));
        assert!(!re.is_match("xdb"));

        let re = pattern_to_regex("db?").unwrap();
        assert!(re.is_match("db1"));
        assert!(!re.is_match("db"));
        assert!(!re.is_match("db12"));

        let re = pattern_to_regex("a.b").unwrap();
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("axb"));
    }

    #[test]
    fn test_match_databases() {
        let dbs = names(&["mysql", "db1", "db2", "dbx", "test", "other"]);
        let matched = match_databases(
            &dbs,
            &names(&["db%", "test", "other"]),
            &names(&["dbx"]),
            &["mysql", "test"],
        )
        .unwrap();
        assert_eq!(matched, names(&["db1", "db2", "other"]));
    }

    #[test]
    fn test_ignore_wins() {
        let dbs = names(&["db1", "db2"]);
        let matched = match_databases(&dbs, &names(&["%"]), &names(&["%"]), &[]).unwrap();
        assert!(matched.is_empty());
    }
}
