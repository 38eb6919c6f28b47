// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

#![allow(dead_code)]

//! In-memory cluster used by the integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dbm_mysql_util::{ER_LOCK_WAIT_TIMEOUT, MySqlError, ProcessListEntry};
use dbm_tendbcluster_ddl::migrator::{MigrationConfig, MigrationState, MigrationTask, ShardMigrator};
use dbm_tendbcluster_ddl::session::{Connector, Session};
use dbm_tendbcluster_ddl::topology::{self, Credentials, Instance, InstanceRole, ServerRecord};
use dbm_tendbcluster_ddl::{Orchestrator, OrchestratorConfig};
use mysql_async::ServerError;
use tokio_util::sync::CancellationToken;

pub const BILL_ID: u64 = 42;
pub const COORDINATOR_ADDR: &str = "10.0.3.1:26000";
pub const MASTER_ROUTER_ADDR: &str = "10.0.2.1:25000";
pub const SLAVE_ROUTER_ADDR: &str = "10.0.2.2:25000";

pub fn shard_addr(shard: u32) -> String {
    format!("10.0.1.{shard}:20000")
}

/// Something that happened on the fake cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Execute { address: String, sql: String },
    Migrate { address: String, db: String, table: String, alter: String },
}

#[derive(Debug, Default)]
pub struct ClusterState {
    pub catalogue: Vec<ServerRecord>,
    pub names: BTreeMap<String, String>,
    pub versions: BTreeMap<String, String>,
    pub databases: BTreeMap<String, Vec<String>>,
    pub server_ids: BTreeMap<String, BTreeSet<u32>>,
    pub processes: BTreeMap<String, Vec<ProcessListEntry>>,
    /// Statements on `address` containing the substring fail.
    pub failures: Vec<(String, String)>,
    pub unreachable: BTreeSet<String>,
    /// Shards whose migration fails.
    pub failing_shards: BTreeSet<u32>,
    pub events: Vec<Event>,
}

/// A coordinator, one master router (newer family), one slave router and
/// `shards` backend shards each holding `db1` and `db2`.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    pub state: Arc<Mutex<ClusterState>>,
}

fn split(address: &str) -> (String, u16) {
    let (host, port) = address.rsplit_once(':').unwrap();
    (host.to_string(), port.parse().unwrap())
}

fn record(name: &str, address: &str, wrapper: &str) -> ServerRecord {
    let (host, port) = split(address);
    ServerRecord {
        server_name: name.into(),
        host,
        port,
        username: "spider".into(),
        password: "spider-pw".into(),
        wrapper: wrapper.into(),
    }
}

impl FakeCluster {
    pub fn new(shards: u32) -> FakeCluster {
        let mut state = ClusterState::default();
        state.catalogue.push(record("SPIDER0", MASTER_ROUTER_ADDR, "SPIDER"));
        state.catalogue.push(record("SPIDER_SLAVE0", SLAVE_ROUTER_ADDR, "SPIDER_SLAVE"));
        state.catalogue.push(record("TDBCTL0", COORDINATOR_ADDR, "TDBCTL"));
        for shard in 0..shards {
            let address = shard_addr(shard);
            state
                .catalogue
                .push(record(&format!("SPT{shard}"), &address, "mysql"));
            state.databases.insert(
                address,
                vec![
                    "information_schema".into(),
                    "mysql".into(),
                    format!("db1_{shard}"),
                    format!("db2_{shard}"),
                ],
            );
        }
        for r in &state.catalogue {
            state
                .names
                .insert(format!("{}:{}", r.host, r.port), r.server_name.clone());
        }
        state
            .versions
            .insert(MASTER_ROUTER_ADDR.into(), "5.7.20-tspider-4.0.5-log".into());
        state
            .versions
            .insert(SLAVE_ROUTER_ADDR.into(), "5.7.20-tspider-3.7.8-log".into());
        FakeCluster {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn coordinator(&self) -> Instance {
        let (host, port) = split(COORDINATOR_ADDR);
        Instance::new(
            "TDBCTL0",
            host,
            port,
            Credentials {
                user: "admin".into(),
                password: "admin-pw".into(),
            },
            InstanceRole::Coordinator,
        )
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            state: Arc::clone(&self.state),
        }
    }

    pub fn migrator(&self) -> FakeMigrator {
        FakeMigrator {
            state: Arc::clone(&self.state),
        }
    }

    /// Resolves the topology and builds an orchestrator writing its command
    /// log under `dir`, where SQL files are also read from.
    pub async fn orchestrator(&self, dir: &Path, parallelism: usize) -> Orchestrator {
        let connector = self.connector();
        let topology = topology::resolve(&connector, self.coordinator(), &[])
            .await
            .unwrap();
        let config = OrchestratorConfig {
            bill_id: BILL_ID,
            sql_dir: dir.to_path_buf(),
            command_log: dir.join("ddl.cmd"),
            parallelism,
            migration: Arc::new(MigrationConfig {
                socket_dir: dir.to_path_buf(),
                ..Default::default()
            }),
        };
        Orchestrator::new(
            Arc::new(connector),
            Arc::new(self.migrator()),
            topology,
            config,
        )
    }

    pub fn events(&self) -> Vec<Event> {
        self.with(|s| s.events.clone())
    }

    /// Schema changes in order, as `NAME: statement` for statements and
    /// `NAME: migrate db.table` for shard migrations. Session setup and
    /// precheck statements are left out.
    pub fn timeline(&self) -> Vec<String> {
        self.with(|s| {
            s.events
                .iter()
                .filter_map(|e| match e {
                    Event::Execute { address, sql } => {
                        let skip = ["SET ", "USE ", "FLUSH ", "UNLOCK "];
                        if skip.iter().any(|p| sql.starts_with(p)) {
                            None
                        } else {
                            Some(format!("{}: {sql}", s.names[address]))
                        }
                    }
                    Event::Migrate {
                        address, db, table, ..
                    } => Some(format!("{}: migrate {db}.{table}", s.names[address])),
                })
                .collect()
        })
    }

    /// Every statement executed on the instance called `name`.
    pub fn executed_on(&self, name: &str) -> Vec<String> {
        self.with(|s| {
            s.events
                .iter()
                .filter_map(|e| match e {
                    Event::Execute { address, sql } if s.names[address] == name => {
                        Some(sql.clone())
                    }
                    _ => None,
                })
                .collect()
        })
    }

    pub fn migrations(&self) -> usize {
        self.with(|s| {
            s.events
                .iter()
                .filter(|e| matches!(e, Event::Migrate { .. }))
                .count()
        })
    }
}

pub fn server_error(code: u16, message: &str) -> MySqlError {
    MySqlError::MySql(mysql_async::Error::Server(ServerError {
        code,
        message: message.into(),
        state: "HY000".into(),
    }))
}

#[derive(Debug)]
pub struct FakeConnector {
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        instance: &Instance,
        _purpose: &str,
    ) -> Result<Box<dyn Session>, MySqlError> {
        let address = instance.address();
        if self.state.lock().unwrap().unreachable.contains(&address) {
            return Err(MySqlError::Generic(anyhow::anyhow!(
                "connection refused: {address}"
            )));
        }
        Ok(Box::new(FakeSession {
            address,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    address: String,
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&mut self, sql: &str) -> Result<(), MySqlError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Execute {
            address: self.address.clone(),
            sql: sql.to_string(),
        });
        let fails = state
            .failures
            .iter()
            .any(|(address, pattern)| *address == self.address && sql.contains(pattern.as_str()));
        if fails {
            Err(server_error(ER_LOCK_WAIT_TIMEOUT, "Lock wait timeout exceeded"))
        } else {
            Ok(())
        }
    }

    async fn query_column(&mut self, sql: &str) -> Result<Vec<String>, MySqlError> {
        let state = self.state.lock().unwrap();
        let rows = match sql {
            "SELECT VERSION()" => vec![state
                .versions
                .get(&self.address)
                .cloned()
                .unwrap_or_else(|| "5.7.20-tmysql-3.4-log".into())],
            "SHOW DATABASES" => state
                .databases
                .get(&self.address)
                .cloned()
                .unwrap_or_default(),
            _ => vec![],
        };
        Ok(rows)
    }

    async fn process_list(&mut self) -> Result<Vec<ProcessListEntry>, MySqlError> {
        let state = self.state.lock().unwrap();
        Ok(state.processes.get(&self.address).cloned().unwrap_or_default())
    }

    async fn server_catalogue(&mut self) -> Result<Vec<ServerRecord>, MySqlError> {
        Ok(self.state.lock().unwrap().catalogue.clone())
    }

    async fn replica_server_ids(&mut self) -> Result<BTreeSet<u32>, MySqlError> {
        let state = self.state.lock().unwrap();
        Ok(state.server_ids.get(&self.address).cloned().unwrap_or_default())
    }

    async fn disconnect(self: Box<Self>) -> Result<(), MySqlError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeMigrator {
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl ShardMigrator for FakeMigrator {
    async fn migrate(
        &self,
        task: MigrationTask,
        _cancel: CancellationToken,
    ) -> Result<MigrationState, anyhow::Error> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Migrate {
            address: task.instance.address(),
            db: task.database.clone(),
            table: task.table.clone(),
            alter: task.alter.clone(),
        });
        if state.failing_shards.contains(&task.shard) {
            anyhow::bail!("gh-ost exit status: 1 (no unique key on {})", task.table);
        }
        Ok(MigrationState::CutoverDone)
    }
}

pub fn write_sql(dir: &Path, name: &str, sql: &str) {
    std::fs::write(dir.join(name), sql).unwrap();
}
