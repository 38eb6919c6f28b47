// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeSet;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row};
use tracing::debug;

use crate::MySqlError;

/// Query a MySQL System Variable
pub async fn query_sys_var(conn: &mut Conn, name: &str) -> Result<String, MySqlError> {
    let value: Option<String> = conn.query_first(format!("SELECT @@{}", name)).await?;
    value.ok_or_else(|| MySqlError::MissingSystemVariable(name.to_string()))
}

/// Returns every server id in use by the replication topology directly
/// attached to this server: its own `server_id` plus the ids of every
/// replica currently registered with it.
pub async fn replica_server_ids(conn: &mut Conn) -> Result<BTreeSet<u32>, MySqlError> {
    let own = query_sys_var(conn, "server_id").await?;
    let own: u32 = own.parse().map_err(|e| MySqlError::UnexpectedRow {
        query: "SELECT @@server_id".into(),
        detail: format!("{own:?}: {e}"),
    })?;

    // This statement was renamed between MySQL 5.7 and 8.0
    let rows: Vec<Row> = match conn.query("SHOW SLAVE HOSTS").await {
        Ok(rows) => rows,
        Err(e) => {
            debug!("SHOW SLAVE HOSTS failed, retrying as SHOW REPLICAS: {e}");
            conn.query("SHOW REPLICAS").await?
        }
    };

    let mut ids = BTreeSet::from([own]);
    for row in rows {
        let id: u32 = match row.get_opt(0) {
            Some(Ok(id)) => id,
            Some(Err(e)) => {
                return Err(MySqlError::UnexpectedRow {
                    query: "SHOW SLAVE HOSTS".into(),
                    detail: format!("Server_id: {e}"),
                });
            }
            None => {
                return Err(MySqlError::UnexpectedRow {
                    query: "SHOW SLAVE HOSTS".into(),
                    detail: "missing Server_id column".into(),
                });
            }
        };
        ids.insert(id);
    }
    Ok(ids)
}
