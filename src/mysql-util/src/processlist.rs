// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Process list inspection.

use mysql_async::prelude::{FromValue, Queryable};
use mysql_async::{Conn, Row};

use crate::MySqlError;

const PROCESSLIST_QUERY: &str = "SHOW FULL PROCESSLIST";

/// One row of `SHOW FULL PROCESSLIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessListEntry {
    pub id: u64,
    pub user: String,
    pub host: String,
    pub db: Option<String>,
    pub command: String,
    /// Seconds the thread has been in its current state.
    pub time: i64,
    pub state: Option<String>,
    pub info: Option<String>,
}

/// Reads the full process list.
///
/// Columns are looked up by name since forks of MySQL append columns of
/// their own to this statement.
pub async fn show_processlist(conn: &mut Conn) -> Result<Vec<ProcessListEntry>, MySqlError> {
    let rows: Vec<Row> = conn.query(PROCESSLIST_QUERY).await?;
    rows.iter()
        .map(|row| {
            Ok(ProcessListEntry {
                id: column(row, "Id")?,
                user: column(row, "User")?,
                host: column::<Option<String>>(row, "Host")?.unwrap_or_default(),
                db: column(row, "db")?,
                command: column(row, "Command")?,
                time: column::<Option<i64>>(row, "Time")?.unwrap_or_default(),
                state: column(row, "State")?,
                info: column(row, "Info")?,
            })
        })
        .collect()
}

fn column<T: FromValue>(row: &Row, name: &str) -> Result<T, MySqlError> {
    match row.get_opt::<T, _>(name) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(MySqlError::UnexpectedRow {
            query: PROCESSLIST_QUERY.into(),
            detail: format!("column {name}: {e}"),
        }),
        None => Err(MySqlError::UnexpectedRow {
            query: PROCESSLIST_QUERY.into(),
            detail: format!("missing column {name}"),
        }),
    }
}
