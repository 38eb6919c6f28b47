// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs a change batch against a cluster.
//!
//! A batch goes through these phases, each of which must complete before the
//! next starts:
//!
//!  1. **Plan.** Every item's patterns are expanded against the databases of
//!     every shard. All shards must agree, and no two items may apply the same
//!     file to the same database.
//!  2. **Parse.** Every SQL file is parsed in full, collecting the tables that
//!     will be altered. Malformed SQL fails the batch here.
//!  3. **Precheck.** See [`crate::precheck`].
//!  4. **Execute.** Statements run strictly one after another. Non-`ALTER`
//!     statements go to the coordinator, which dispatches them. An additive
//!     `ALTER` is migrated on the shards, then applied on the routers, then
//!     recorded on the coordinator. A destructive `ALTER` is applied on the
//!     routers first, then migrated on the shards, then recorded on the
//!     coordinator.
//!
//! Batches against the same coordinator are serialized within the process.
//! Nothing is rolled back on failure.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::applier::{CoordinatorMode, apply_on_coordinator, apply_on_routers};
use crate::batch::{
    ChangeItem, PlannedItem, check_duplicate_objects, check_plans_agree, expand_items,
    logical_databases,
};
use crate::error::{DdlError, ParseError};
use crate::migrator::{CommandLog, MigrationConfig, MigrationTask, ShardMigrator, migrate_shards};
use crate::parser::{Statement, StatementKind, parse_statements};
use crate::precheck::{PrecheckTables, run_precheck};
use crate::session::{Connector, close};
use crate::topology::{Instance, Topology, read_catalogue};

static COORDINATOR_LOCKS: LazyLock<Mutex<BTreeMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(Default::default);

/// Exclusive hold on one coordinator. The registry entry is dropped once no
/// batch holds or waits for it.
struct CoordinatorGuard {
    address: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CoordinatorGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = COORDINATOR_LOCKS.lock().expect("lock poisoned");
        if locks
            .get(&self.address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.address);
        }
    }
}

async fn lock_coordinator(address: String) -> CoordinatorGuard {
    let lock = {
        let mut locks = COORDINATOR_LOCKS.lock().expect("lock poisoned");
        Arc::clone(locks.entry(address.clone()).or_default())
    };
    CoordinatorGuard {
        address,
        guard: Some(lock.lock_owned().await),
    }
}

/// Settings of one batch.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identifies the batch in task names, server ids and logs.
    pub bill_id: u64,
    /// Directory the items' SQL files are relative to.
    pub sql_dir: PathBuf,
    /// Where engine invocations are recorded.
    pub command_log: PathBuf,
    /// Shards migrated at once.
    pub parallelism: usize,
    /// Row-copy engine options.
    pub migration: Arc<MigrationConfig>,
}

/// A statement that was fully applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedStatement {
    /// The batch item.
    pub line_id: u32,
    /// The SQL file.
    pub file: String,
    /// The logical database.
    pub db: Option<String>,
    /// How it was applied.
    pub kind: StatementKind,
    /// The altered table.
    pub table: Option<String>,
}

/// Outcome of a successful batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Every applied statement, in order. `USE` statements are omitted.
    pub applied: Vec<AppliedStatement>,
    /// Number of `ALTER` statements migrated on the shards.
    pub migrations: usize,
}

/// Executes change batches against one cluster.
#[derive(Debug)]
pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    migrator: Arc<dyn ShardMigrator>,
    topology: Topology,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator for a resolved topology.
    pub fn new(
        connector: Arc<dyn Connector>,
        migrator: Arc<dyn ShardMigrator>,
        topology: Topology,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        Orchestrator {
            connector,
            migrator,
            topology,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Returns a token that cancels the running batch.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The cluster the batch runs against.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Runs `items`.
    pub async fn run(&self, items: &[ChangeItem]) -> Result<BatchReport, DdlError> {
        self.config.migration.validate()?;
        let coordinator = self.topology.coordinator();
        let _guard = lock_coordinator(coordinator.address()).await;
        info!(
            bill_id = self.config.bill_id,
            items = items.len(),
            %coordinator,
            "starting ddl batch"
        );

        let plan = self.plan(items).await?;
        let sources = self.load_sql(&plan).await?;
        let tables = collect_precheck_tables(&plan, &sources)?;
        self.check_cancelled()?;
        run_precheck(self.connector.as_ref(), &self.topology, &tables).await?;

        let mut log = CommandLog::create(&self.config.command_log).await?;
        let mut report = BatchReport::default();
        for item in &plan {
            for file in &item.sql_files {
                let sql = &sources[file];
                for db in &item.dbs {
                    for stmt in parse_statements(file, sql, Some(db.clone())) {
                        let stmt = stmt?;
                        if stmt.kind == StatementKind::Use {
                            continue;
                        }
                        self.check_cancelled()?;
                        self.apply(file, &stmt, &mut log, &mut report).await?;
                        report.applied.push(AppliedStatement {
                            line_id: item.line_id,
                            file: file.clone(),
                            db: stmt.db,
                            kind: stmt.kind,
                            table: stmt.table,
                        });
                    }
                }
            }
        }
        info!(
            bill_id = self.config.bill_id,
            statements = report.applied.len(),
            migrations = report.migrations,
            command_log = %log.path().display(),
            "ddl batch complete"
        );
        Ok(report)
    }

    fn check_cancelled(&self) -> Result<(), DdlError> {
        if self.cancel.is_cancelled() {
            Err(DdlError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn plan(&self, items: &[ChangeItem]) -> Result<Vec<PlannedItem>, DdlError> {
        let mut reference: Option<(u32, Vec<PlannedItem>)> = None;
        for backend in self.topology.backends() {
            let Some(shard) = backend.shard() else {
                continue;
            };
            let physical = self.list_databases(backend).await?;
            let plan = expand_items(items, &logical_databases(&physical, shard))?;
            check_duplicate_objects(&plan, shard)?;
            match &reference {
                None => reference = Some((shard, plan)),
                Some((reference_shard, reference_plan)) => {
                    check_plans_agree(*reference_shard, reference_plan, shard, &plan)?
                }
            }
        }
        reference
            .map(|(_, plan)| plan)
            .ok_or_else(|| DdlError::TopologyUnavailable("no backend shard to plan on".into()))
    }

    async fn list_databases(&self, backend: &Instance) -> Result<Vec<String>, DdlError> {
        let context = || format!("listing databases on {backend}");
        let mut session = self
            .connector
            .connect(backend, "list-databases")
            .await
            .map_err(|e| DdlError::mysql(context(), e))?;
        let dbs = session.query_column("SHOW DATABASES").await;
        close(session).await;
        dbs.map_err(|e| DdlError::mysql(context(), e))
    }

    async fn load_sql(&self, plan: &[PlannedItem]) -> Result<BTreeMap<String, String>, DdlError> {
        let mut sources = BTreeMap::new();
        for file in plan.iter().flat_map(|item| &item.sql_files) {
            if sources.contains_key(file) {
                continue;
            }
            let path = self.config.sql_dir.join(file);
            let sql = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| DdlError::io(path, e))?;
            sources.insert(file.clone(), sql);
        }
        Ok(sources)
    }

    async fn apply(
        &self,
        file: &str,
        stmt: &Statement,
        log: &mut CommandLog,
        report: &mut BatchReport,
    ) -> Result<(), DdlError> {
        let connector = self.connector.as_ref();
        let coordinator = self.topology.coordinator();
        let routers = self.topology.routers();
        let db = stmt.db.as_deref();

        if !stmt.is_alter() {
            info!(file, line = stmt.line, ?db, "dispatching statement via coordinator");
            return apply_on_coordinator(
                connector,
                coordinator,
                CoordinatorMode::Dispatch,
                db,
                &stmt.text,
            )
            .await;
        }

        let (Some(db_name), Some(table)) = (db, stmt.table.as_deref()) else {
            return Err(ParseError::new(file, stmt.line, "ALTER TABLE without a target").into());
        };
        self.verify_topology().await?;
        report.migrations += 1;
        let tasks = self
            .prepare_tasks(report.migrations, db_name, table, &stmt.alter_clause())
            .await?;
        for task in &tasks {
            log.record(task).await?;
        }
        info!(
            file,
            line = stmt.line,
            db = db_name,
            table,
            kind = ?stmt.kind,
            "applying alter"
        );

        if stmt.kind == StatementKind::AlterDestructive {
            apply_on_routers(connector, routers, db, &stmt.text, &self.cancel).await?;
            self.migrate(tasks).await?;
        } else {
            self.migrate(tasks).await?;
            apply_on_routers(connector, routers, db, &stmt.text, &self.cancel).await?;
        }
        self.check_cancelled()?;
        apply_on_coordinator(
            connector,
            coordinator,
            CoordinatorMode::LocalOnly,
            db,
            &stmt.text,
        )
        .await
    }

    async fn migrate(&self, tasks: Vec<MigrationTask>) -> Result<(), DdlError> {
        let res = migrate_shards(
            Arc::clone(&self.migrator),
            tasks,
            self.config.parallelism,
            &self.cancel,
        )
        .await;
        if res.is_err() && self.cancel.is_cancelled() {
            warn!("shard migration interrupted by cancellation");
        }
        res
    }

    async fn verify_topology(&self) -> Result<(), DdlError> {
        let records = read_catalogue(self.connector.as_ref(), self.topology.coordinator())
            .await
            .map_err(|e| DdlError::TopologyChanged(e.to_string()))?;
        self.topology.verify_catalogue(&records)
    }

    async fn prepare_tasks(
        &self,
        ordinal: usize,
        db: &str,
        table: &str,
        alter: &str,
    ) -> Result<Vec<MigrationTask>, DdlError> {
        let mut tasks = Vec::new();
        let mut sockets = BTreeSet::new();
        for backend in self.topology.backends() {
            let task = MigrationTask::new(
                self.config.bill_id,
                ordinal,
                backend,
                db,
                table,
                alter,
                Arc::clone(&self.config.migration),
            )?;
            let exists = tokio::fs::try_exists(&task.socket_file)
                .await
                .map_err(|e| DdlError::io(&task.socket_file, e))?;
            if exists || !sockets.insert(task.socket_file.clone()) {
                return Err(DdlError::SocketCollision(task.socket_file));
            }
            self.check_server_id(&task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn check_server_id(&self, task: &MigrationTask) -> Result<(), DdlError> {
        let context = || format!("reading server ids around {}", task.instance);
        let mut session = self
            .connector
            .connect(&task.instance, "server-id-check")
            .await
            .map_err(|e| DdlError::mysql(context(), e))?;
        let ids = session.replica_server_ids().await;
        close(session).await;
        let ids = ids.map_err(|e| DdlError::mysql(context(), e))?;
        if ids.contains(&task.server_id) {
            return Err(DdlError::ServerIdCollision {
                instance: task.instance.address(),
                server_id: task.server_id,
            });
        }
        Ok(())
    }
}

/// Parses every file once per database it applies to and collects the
/// altered tables.
fn collect_precheck_tables(
    plan: &[PlannedItem],
    sources: &BTreeMap<String, String>,
) -> Result<PrecheckTables, DdlError> {
    let mut tables = PrecheckTables::default();
    for item in plan {
        for file in &item.sql_files {
            let sql = &sources[file];
            for db in &item.dbs {
                for stmt in parse_statements(file, sql, Some(db.clone())) {
                    let stmt = stmt?;
                    if let (true, Some(db), Some(table)) = (stmt.is_alter(), &stmt.db, &stmt.table)
                    {
                        tables.insert(db, table);
                    }
                }
            }
        }
    }
    Ok(tables)
}
