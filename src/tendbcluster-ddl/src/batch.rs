// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Change batches and their expansion onto databases.

use std::collections::BTreeMap;

use dbm_mysql_util::SYSTEM_SCHEMAS;
use serde::{Deserialize, Serialize};

use crate::error::{DdlError, DuplicateObject};
use crate::matcher::match_databases;
use crate::topology::parse_shard_physical_name;

/// One user-requested change: SQL files applied to every matched database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeItem {
    /// Identifies the item in reports.
    pub line_id: u32,
    /// SQL files, relative to the batch's SQL directory, in apply order.
    pub sql_files: Vec<String>,
    /// Inclusion patterns.
    pub dbnames: Vec<String>,
    /// Exclusion patterns.
    #[serde(default)]
    pub ignore_dbnames: Vec<String>,
}

/// A batch as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Identifies the batch. One is generated when absent.
    #[serde(default)]
    pub bill_id: Option<u64>,
    /// The changes, in apply order.
    pub items: Vec<ChangeItem>,
}

/// A change item resolved to logical databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    /// The originating item.
    pub line_id: u32,
    /// Its SQL files.
    pub sql_files: Vec<String>,
    /// The logical databases it applies to, in listing order.
    pub dbs: Vec<String>,
}

/// Returns the logical names of the databases present on `shard`, given the
/// physical names listed on it.
pub fn logical_databases(physical: &[String], shard: u32) -> Vec<String> {
    physical
        .iter()
        .filter_map(|name| match parse_shard_physical_name(name) {
            Some((db, n)) if n == shard => Some(db.to_string()),
            _ => None,
        })
        .collect()
}

/// Resolves every item against the logical databases of one shard.
///
/// An item with SQL files that matches nothing fails the whole batch.
pub fn expand_items(
    items: &[ChangeItem],
    logical_dbs: &[String],
) -> Result<Vec<PlannedItem>, DdlError> {
    items
        .iter()
        .map(|item| {
            let dbs = match_databases(
                logical_dbs,
                &item.dbnames,
                &item.ignore_dbnames,
                SYSTEM_SCHEMAS,
            )?;
            if dbs.is_empty() && !item.sql_files.is_empty() {
                return Err(DdlError::NoMatchedDatabase {
                    line_id: item.line_id,
                    intention: item.dbnames.clone(),
                    ignore: item.ignore_dbnames.clone(),
                });
            }
            Ok(PlannedItem {
                line_id: item.line_id,
                sql_files: item.sql_files.clone(),
                dbs,
            })
        })
        .collect()
}

/// Fails if two items of `plan` would apply the same file to the same
/// database on `shard`. Every collision is reported.
pub fn check_duplicate_objects(plan: &[PlannedItem], shard: u32) -> Result<(), DdlError> {
    let mut owners: BTreeMap<(&str, &str), u32> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for item in plan {
        for file in &item.sql_files {
            for db in &item.dbs {
                match owners.get(&(file.as_str(), db.as_str())) {
                    Some(&first) if first != item.line_id => duplicates.push(DuplicateObject {
                        shard,
                        file: file.clone(),
                        db: db.clone(),
                        first_line_id: first,
                        line_id: item.line_id,
                    }),
                    Some(_) => {}
                    None => {
                        owners.insert((file.as_str(), db.as_str()), item.line_id);
                    }
                }
            }
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(DdlError::DuplicateObjectAcrossBatch(duplicates))
    }
}

/// Fails unless `other`, computed on `shard`, matches `reference`, computed
/// on `reference_shard`.
pub fn check_plans_agree(
    reference_shard: u32,
    reference: &[PlannedItem],
    shard: u32,
    other: &[PlannedItem],
) -> Result<(), DdlError> {
    for (expected, actual) in reference.iter().zip(other) {
        if expected.dbs != actual.dbs {
            return Err(DdlError::ShardPlanMismatch {
                line_id: expected.line_id,
                reference_shard,
                expected: expected.dbs.clone(),
                shard,
                actual: actual.dbs.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(line_id: u32, files: &[&str], dbnames: &[&str], ignore: &[&str]) -> ChangeItem {
        let strings = |s: &[&str]| s.iter().map(|s| s.to_string()).collect();
        ChangeItem {
            line_id,
            sql_files: strings(files),
            dbnames: strings(dbnames),
            ignore_dbnames: strings(ignore),
        }
    }

    fn dbs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_logical_databases() {
        let physical = dbs(&["mysql", "db1_0", "db1_1", "db_2_1", "db3_10"]);
        assert_eq!(logical_databases(&physical, 1), dbs(&["db1", "db_2"]));
        assert_eq!(logical_databases(&physical, 10), dbs(&["db3"]));
    }

    #[test]
    fn test_expand_items() {
        let logical = dbs(&["db1", "db2", "sys", "app"]);
        let plan = expand_items(
            &[
                item(1, &["a.sql"], &["db%"], &["db2"]),
                item(2, &["b.sql"], &["%"], &[]),
            ],
            &logical,
        )
        .unwrap();
        assert_eq!(plan[0].dbs, dbs(&["db1"]));
        assert_eq!(plan[1].dbs, dbs(&["db1", "db2", "app"]));
    }

    #[test]
    fn test_unmatched_item_fails() {
        let err = expand_items(&[item(7, &["a.sql"], &["nope%"], &[])], &dbs(&["db1"]))
            .unwrap_err();
        assert!(matches!(err, DdlError::NoMatchedDatabase { line_id: 7, .. }));
    }

    #[test]
    fn test_duplicates_across_items() {
        let plan = expand_items(
            &[
                item(1, &["a.sql"], &["db%"], &[]),
                item(2, &["a.sql", "b.sql"], &["db1"], &[]),
                item(3, &["a.sql"], &["other"], &[]),
            ],
            &dbs(&["db1", "db2", "other"]),
        )
        .unwrap();
        let Err(DdlError::DuplicateObjectAcrossBatch(dups)) = check_duplicate_objects(&plan, 4)
        else {
            panic!("expected duplicates");
        };
        assert_eq!(
            dups,
            vec![DuplicateObject {
                shard: 4,
                file: "a.sql".into(),
                db: "db1".into(),
                first_line_id: 1,
                line_id: 2,
            }]
        );
    }

    #[test]
    fn test_same_item_repeating_a_file_is_not_a_duplicate() {
        let plan = expand_items(&[item(1, &["a.sql", "a.sql"], &["db1"], &[])], &dbs(&["db1"]))
            .unwrap();
        check_duplicate_objects(&plan, 0).unwrap();
    }

    #[test]
    fn test_plans_agree() {
        let items = [item(1, &["a.sql"], &["db%"], &[])];
        let a = expand_items(&items, &dbs(&["db1", "db2"])).unwrap();
        let b = expand_items(&items, &dbs(&["db1"])).unwrap();
        check_plans_agree(0, &a, 1, &a).unwrap();
        assert!(matches!(
            check_plans_agree(0, &a, 1, &b),
            Err(DdlError::ShardPlanMismatch { shard: 1, .. })
        ));
    }

    #[test]
    fn test_batch_json() {
        let batch: ChangeBatch = serde_json::from_str(
            r#"{"items": [{"line_id": 1, "sql_files": ["a.sql"], "dbnames": ["db%"]}]}"#,
        )
        .unwrap();
        assert_eq!(batch.bill_id, None);
        assert_eq!(batch.items, vec![item(1, &["a.sql"], &["db%"], &[])]);
    }
}
