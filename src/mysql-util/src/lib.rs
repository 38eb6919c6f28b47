// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL utility library.

use std::time::Duration;

mod connection;
pub use connection::{
    Config, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TCP_KEEPALIVE, MySqlConn, TimeoutConfig,
};

mod replication;
pub use replication::{query_sys_var, replica_server_ids};

pub mod processlist;
pub use processlist::{ProcessListEntry, show_processlist};

pub mod schemas;
pub use schemas::SYSTEM_SCHEMAS;

#[derive(Debug, thiserror::Error)]
pub enum MySqlError {
    #[error("error creating mysql connection with config: {0}")]
    InvalidClientConfig(String),
    #[error("mysql system variable '{0}' is not set")]
    MissingSystemVariable(String),
    #[error("unexpected row shape from '{query}': {detail}")]
    UnexpectedRow { query: String, detail: String },
    /// Any other error we bail on.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    /// A mysql_async error.
    #[error(transparent)]
    MySql(#[from] mysql_async::Error),
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),
}

impl MySqlError {
    /// Returns the server error code, if this error was reported by the
    /// server rather than the client or the network.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            MySqlError::MySql(mysql_async::Error::Server(e)) => Some(e.code),
            _ => None,
        }
    }
}

/// Quotes MySQL identifiers. [See MySQL quote_identifier()](https://github.com/mysql/mysql-sys/blob/master/functions/quote_identifier.sql)
pub fn quote_identifier(identifier: &str) -> String {
    let mut escaped = identifier.replace("`", "``");
    escaped.insert(0, '`');
    escaped.push('`');
    escaped
}

/// Quotes a `schema`.`table` pair.
pub fn quote_qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html#error_er_lock_wait_timeout
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;

// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html#error_er_no_such_table
pub const ER_NO_SUCH_TABLE: u16 = 1146;
