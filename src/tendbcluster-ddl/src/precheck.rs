// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Blocking precheck.
//!
//! Before a batch runs, every instance it will touch is asked two questions
//! about every table it will alter:
//!
//!  1. Is there a non-idle session, other than replication or scheduler
//!     threads, that has been running for more than a minute and whose
//!     statement mentions the table?
//!  2. Can the table be flushed with a read lock within one second?
//!
//! Any "yes" to the first or "no" to the second fails the batch before
//! anything is changed. Routers and the coordinator are checked with logical
//! database names, backend shards with their physical names. All instances
//! are checked concurrently and every failure is reported.

use std::collections::{BTreeMap, BTreeSet};

use dbm_mysql_util::{ER_NO_SUCH_TABLE, MySqlError, ProcessListEntry, quote_qualified};
use futures::future::join_all;
use itertools::Itertools;
use tracing::{info, warn};

use crate::error::{DdlError, PrecheckFailure};
use crate::session::{Connector, Session, close};
use crate::topology::{Instance, Topology, shard_physical_name};

/// Sessions older than this many seconds are considered long running.
pub const LONG_RUNNING_SECS: i64 = 60;

/// Tables flushed per `FLUSH TABLES ... WITH READ LOCK`.
pub const FLUSH_CHUNK: usize = 10;

/// Table count from which the first pass flushes [`FAST_FLUSH_CHUNK`] tables
/// at a time.
pub const FAST_FLUSH_THRESHOLD: usize = 1000;

/// Tables flushed per statement in the first pass over large table sets.
pub const FAST_FLUSH_CHUNK: usize = 100;

const LOCK_WAIT_TIMEOUT: &str = "SET SESSION lock_wait_timeout = 1";
const UNLOCK_TABLES: &str = "UNLOCK TABLES";

const IGNORED_USERS: &[&str] = &["system user", "event_scheduler"];
const IGNORED_COMMANDS: &[&str] = &["Sleep", "Binlog Dump", "Binlog Dump GTID", "Daemon"];

/// Tables to check, grouped by database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecheckTables {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl PrecheckTables {
    /// Records `db.table`.
    pub fn insert(&mut self, db: &str, table: &str) {
        self.tables
            .entry(db.to_string())
            .or_default()
            .insert(table.to_string());
    }

    /// Reports whether no table was recorded.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Returns the number of recorded tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Iterates over databases and their tables.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.tables.iter().map(|(db, tables)| (db.as_str(), tables))
    }

    /// Returns the same tables with database names translated to their
    /// physical names on `shard`.
    pub fn for_shard(&self, shard: u32) -> PrecheckTables {
        PrecheckTables {
            tables: self
                .tables
                .iter()
                .map(|(db, tables)| (shard_physical_name(db, shard), tables.clone()))
                .collect(),
        }
    }
}

/// Checks every router, the coordinator and every backend shard.
pub async fn run_precheck(
    connector: &dyn Connector,
    topology: &Topology,
    tables: &PrecheckTables,
) -> Result<(), DdlError> {
    if tables.is_empty() {
        return Ok(());
    }
    let mut targets: Vec<(&Instance, PrecheckTables)> = topology
        .routers()
        .iter()
        .chain(std::iter::once(topology.coordinator()))
        .map(|instance| (instance, tables.clone()))
        .collect();
    for backend in topology.backends() {
        if let Some(shard) = backend.shard() {
            targets.push((backend, tables.for_shard(shard)));
        }
    }
    info!(
        instances = targets.len(),
        tables = tables.len(),
        "running blocking precheck"
    );
    let failures: Vec<PrecheckFailure> = join_all(
        targets
            .iter()
            .map(|(instance, tables)| precheck_instance(connector, instance, tables)),
    )
    .await
    .into_iter()
    .flatten()
    .collect();
    if failures.is_empty() {
        info!("blocking precheck passed");
        Ok(())
    } else {
        for failure in &failures {
            warn!("precheck: {failure}");
        }
        Err(DdlError::PrecheckFailed(failures))
    }
}

/// Checks one instance, returning every problem found.
pub async fn precheck_instance(
    connector: &dyn Connector,
    instance: &Instance,
    tables: &PrecheckTables,
) -> Vec<PrecheckFailure> {
    let mut session = match connector.connect(instance, "precheck").await {
        Ok(session) => session,
        Err(e) => {
            return vec![PrecheckFailure::Unreachable {
                instance: instance.to_string(),
                error: e.to_string(),
            }];
        }
    };
    let failures = check_session(session.as_mut(), &instance.to_string(), tables).await;
    close(session).await;
    failures
}

async fn check_session(
    session: &mut dyn Session,
    instance: &str,
    tables: &PrecheckTables,
) -> Vec<PrecheckFailure> {
    let unreachable = |e: MySqlError| {
        vec![PrecheckFailure::Unreachable {
            instance: instance.to_string(),
            error: e.to_string(),
        }]
    };
    if let Err(e) = session.execute(LOCK_WAIT_TIMEOUT).await {
        return unreachable(e);
    }
    let processes = match session.process_list().await {
        Ok(processes) => processes,
        Err(e) => return unreachable(e),
    };

    let mut failures = Vec::new();
    for (_, db_tables) in tables.iter() {
        for table in db_tables {
            for process in processes.iter().filter(|p| is_blocking(p, table)) {
                failures.push(PrecheckFailure::BlockedByProcess {
                    instance: instance.to_string(),
                    table: table.clone(),
                    process_id: process.id,
                    user: process.user.clone(),
                    time: process.time,
                    info: process.info.clone().unwrap_or_default(),
                });
            }
        }
    }
    let chunk_size = first_pass_chunk_size(tables.len());
    for (db, db_tables) in tables.iter() {
        let db_tables: Vec<&str> = db_tables.iter().map(String::as_str).collect();
        for (chunk, error) in flush_with_read_lock(session, db, &db_tables, chunk_size).await {
            failures.push(PrecheckFailure::BlockedByLock {
                instance: instance.to_string(),
                tables: chunk.iter().map(|t| format!("{db}.{t}")).collect(),
                error: error.to_string(),
            });
        }
    }
    failures
}

/// Reports whether `process` is a long running session that references
/// `table`.
pub fn is_blocking(process: &ProcessListEntry, table: &str) -> bool {
    if IGNORED_COMMANDS.contains(&process.command.as_str())
        || IGNORED_USERS.contains(&process.user.as_str())
        || process.time <= LONG_RUNNING_SECS
    {
        return false;
    }
    process
        .info
        .as_deref()
        .is_some_and(|info| info.to_lowercase().contains(&table.to_lowercase()))
}

/// Returns the chunk size of the first flush pass over `n` tables.
pub fn first_pass_chunk_size(n: usize) -> usize {
    if n >= FAST_FLUSH_THRESHOLD {
        FAST_FLUSH_CHUNK
    } else {
        FLUSH_CHUNK
    }
}

/// Flushes `tables` of `db` with a read lock, releasing the lock after every
/// attempt. Returns each group of tables that could not be flushed.
///
/// The first pass flushes `chunk_size` tables at a time, sized from the
/// instance's whole table set; a chunk larger than [`FLUSH_CHUNK`] that
/// fails is retried in chunks of [`FLUSH_CHUNK`]. A group that fails
/// only because a table does not exist yet is retried table by table, and
/// missing tables are not failures.
async fn flush_with_read_lock<'a>(
    session: &mut dyn Session,
    db: &str,
    tables: &[&'a str],
    chunk_size: usize,
) -> Vec<(Vec<&'a str>, MySqlError)> {
    let mut failures = Vec::new();
    for chunk in tables.chunks(chunk_size) {
        let Err(e) = try_flush(session, db, chunk).await else {
            continue;
        };
        if chunk.len() > FLUSH_CHUNK {
            for small in chunk.chunks(FLUSH_CHUNK) {
                if let Err(e) = try_flush(session, db, small).await {
                    flush_failed(session, db, small, e, &mut failures).await;
                }
            }
        } else {
            flush_failed(session, db, chunk, e, &mut failures).await;
        }
    }
    failures
}

async fn flush_failed<'a>(
    session: &mut dyn Session,
    db: &str,
    chunk: &[&'a str],
    error: MySqlError,
    failures: &mut Vec<(Vec<&'a str>, MySqlError)>,
) {
    if error.server_code() != Some(ER_NO_SUCH_TABLE) {
        failures.push((chunk.to_vec(), error));
        return;
    }
    if chunk.len() == 1 {
        return;
    }
    for table in chunk {
        if let Err(e) = try_flush(session, db, std::slice::from_ref(table)).await {
            if e.server_code() != Some(ER_NO_SUCH_TABLE) {
                failures.push((vec![*table], e));
            }
        }
    }
}

async fn try_flush(session: &mut dyn Session, db: &str, tables: &[&str]) -> Result<(), MySqlError> {
    let sql = format!(
        "FLUSH TABLES {} WITH READ LOCK",
        tables.iter().map(|t| quote_qualified(db, t)).join(", ")
    );
    let flushed = session.execute(&sql).await;
    let unlocked = session.execute(UNLOCK_TABLES).await;
    flushed.and(unlocked)
}
