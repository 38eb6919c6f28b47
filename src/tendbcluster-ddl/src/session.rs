// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Sessions against cluster instances.
//!
//! Everything the executor does to an instance goes through a [`Session`]
//! obtained from a [`Connector`]. Sessions are opened for one unit of work
//! and handed back to [`close`] when that work ends, whether it succeeded or
//! not.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use dbm_mysql_util::{
    Config, MySqlConn, MySqlError, ProcessListEntry, TimeoutConfig, replica_server_ids,
    show_processlist,
};
use mysql_async::prelude::Queryable;
use tracing::warn;

use crate::topology::{Instance, ServerRecord};

const SERVER_CATALOGUE_QUERY: &str =
    "SELECT Server_name, Host, Port, Username, Password, Wrapper FROM mysql.servers";

/// An open session against one instance.
#[async_trait]
pub trait Session: Send {
    /// Executes a statement, discarding any result set.
    async fn execute(&mut self, sql: &str) -> Result<(), MySqlError>;

    /// Runs a query and returns the first column of every row.
    async fn query_column(&mut self, sql: &str) -> Result<Vec<String>, MySqlError>;

    /// Returns the full process list.
    async fn process_list(&mut self) -> Result<Vec<ProcessListEntry>, MySqlError>;

    /// Reads the coordinator's cluster catalogue.
    async fn server_catalogue(&mut self) -> Result<Vec<ServerRecord>, MySqlError>;

    /// Returns the server ids of the instance and of its registered replicas.
    async fn replica_server_ids(&mut self) -> Result<BTreeSet<u32>, MySqlError>;

    /// Ends the session.
    async fn disconnect(self: Box<Self>) -> Result<(), MySqlError>;
}

/// Opens sessions against instances.
#[async_trait]
pub trait Connector: fmt::Debug + Send + Sync {
    /// Opens a session against `instance`. `purpose` names the work the
    /// session is for in logs.
    async fn connect(
        &self,
        instance: &Instance,
        purpose: &str,
    ) -> Result<Box<dyn Session>, MySqlError>;
}

/// Ends a session, logging rather than surfacing a failure to disconnect.
pub async fn close(session: Box<dyn Session>) {
    if let Err(e) = session.disconnect().await {
        warn!("error disconnecting session: {e:#}");
    }
}

/// A [`Connector`] that talks to real MySQL-protocol instances.
#[derive(Debug, Clone, Default)]
pub struct MySqlConnector {
    timeouts: TimeoutConfig,
}

impl MySqlConnector {
    /// Creates a connector that applies `timeouts` to every session.
    pub fn new(timeouts: TimeoutConfig) -> MySqlConnector {
        MySqlConnector { timeouts }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(
        &self,
        instance: &Instance,
        purpose: &str,
    ) -> Result<Box<dyn Session>, MySqlError> {
        let config = Config::tcp(
            &instance.host,
            instance.port,
            &instance.credentials.user,
            &instance.credentials.password,
            self.timeouts,
        )?;
        let conn = config.connect(&format!("{purpose} {}", instance.name)).await?;
        Ok(Box::new(MySqlSession { conn }))
    }
}

#[derive(Debug)]
struct MySqlSession {
    conn: MySqlConn,
}

#[async_trait]
impl Session for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<(), MySqlError> {
        self.conn.query_drop(sql).await?;
        Ok(())
    }

    async fn query_column(&mut self, sql: &str) -> Result<Vec<String>, MySqlError> {
        let rows: Vec<Option<String>> = self.conn.query(sql).await?;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn process_list(&mut self) -> Result<Vec<ProcessListEntry>, MySqlError> {
        show_processlist(&mut self.conn).await
    }

    async fn server_catalogue(&mut self) -> Result<Vec<ServerRecord>, MySqlError> {
        let rows: Vec<(String, String, u16, String, String, String)> =
            self.conn.query(SERVER_CATALOGUE_QUERY).await?;
        Ok(rows
            .into_iter()
            .map(
                |(server_name, host, port, username, password, wrapper)| ServerRecord {
                    server_name,
                    host,
                    port,
                    username,
                    password,
                    wrapper,
                },
            )
            .collect())
    }

    async fn replica_server_ids(&mut self) -> Result<BTreeSet<u32>, MySqlError> {
        replica_server_ids(&mut self.conn).await
    }

    async fn disconnect(self: Box<Self>) -> Result<(), MySqlError> {
        self.conn.disconnect().await
    }
}
