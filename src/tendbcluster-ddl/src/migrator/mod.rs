// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shard-parallel online schema migration.
//!
//! One `ALTER TABLE` becomes one [`MigrationTask`] per backend shard. The
//! tasks run concurrently, bounded by a parallelism limit, and are always
//! joined: [`migrate_shards`] returns only after every task has finished,
//! reporting all failed shards together.

mod command_log;
mod ghost;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dbm_ore::process::{REDACTED, command_line};
use dbm_ore::task::JoinSetExt;
use derivative::Derivative;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DdlError, ShardFailure};
use crate::topology::{Instance, shard_physical_name};

pub use crate::migrator::command_log::CommandLog;
pub use crate::migrator::ghost::{GhostMigrator, send_socket_command};

/// Returns the default number of shards migrated at once.
pub fn default_parallelism() -> usize {
    (num_cpus::get() / 2).max(1)
}

/// Row-copy engine options shared by every task of a batch.
///
/// Keys are spelled as the engine's own flags, so both a JSON file and
/// `key=value` overrides use the same names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct MigrationConfig {
    /// Rows copied per chunk.
    pub chunk_size: u64,
    /// Binlog events applied per batch.
    pub dml_batch_size: u64,
    /// Heartbeat injection interval.
    pub heartbeat_interval_millis: u64,
    /// Sleep time relative to work time after each chunk.
    pub nice_ratio: f64,
    /// Replication lag above which the engine throttles.
    pub max_lag_millis: u64,
    /// Status thresholds above which the engine throttles, e.g.
    /// `Threads_running=25`.
    pub max_load: Option<String>,
    /// Retries of failed operations.
    pub default_retries: u64,
    /// Lock wait timeout of the cut-over.
    pub cut_over_lock_timeout_seconds: u64,
    /// Upper bound, in seconds, of the retry backoff.
    pub exponential_backoff_max_interval: u64,
    /// URL polled to decide whether to throttle.
    pub throttle_http: Option<String>,
    /// Poll interval of `throttle_http`.
    pub throttle_http_interval_millis: u64,
    /// Poll timeout of `throttle_http`.
    pub throttle_http_timeout_millis: u64,
    /// Run directly against a master.
    pub allow_on_master: bool,
    /// Switch the master's binlog format to ROW.
    pub switch_to_rbr: bool,
    /// Assume the binlog format is already ROW.
    pub assume_rbr: bool,
    /// Migrate on a replica and leave the master untouched.
    pub test_on_replica: bool,
    /// Migrate on a replica only.
    pub migrate_on_replica: bool,
    /// Count table rows concurrently with the copy.
    pub concurrent_rowcount: bool,
    /// Timestamp the name of the table swapped out at cut-over.
    pub timestamp_old_table: bool,
    /// `innodb` or `rocksdb`.
    pub storage_engine: String,
    /// Path of the engine binary.
    pub ghost_binary: PathBuf,
    /// Directory of the per-task control sockets.
    pub socket_dir: PathBuf,
    /// Directory searched for per-task overrides on SIGHUP.
    pub reload_dir: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> MigrationConfig {
        MigrationConfig {
            chunk_size: 1000,
            dml_batch_size: 10,
            heartbeat_interval_millis: 100,
            nice_ratio: 0.0,
            max_lag_millis: 1500,
            max_load: None,
            default_retries: 60,
            cut_over_lock_timeout_seconds: 10,
            exponential_backoff_max_interval: 64,
            throttle_http: None,
            throttle_http_interval_millis: 100,
            throttle_http_timeout_millis: 1000,
            allow_on_master: false,
            switch_to_rbr: false,
            assume_rbr: false,
            test_on_replica: false,
            migrate_on_replica: false,
            concurrent_rowcount: true,
            timestamp_old_table: true,
            storage_engine: "innodb".into(),
            ghost_binary: PathBuf::from("gh-ost"),
            socket_dir: PathBuf::from("/tmp"),
            reload_dir: None,
        }
    }
}

impl MigrationConfig {
    /// Sets one option from its textual form.
    ///
    /// `value` is read as JSON when it parses as such and as a plain string
    /// otherwise, so `chunk-size=500`, `allow-on-master=true` and
    /// `max-load=Threads_running=25` all work.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), DdlError> {
        let invalid = |e: serde_json::Error| {
            DdlError::InvalidMigrationConfig(format!("{key}={value}: {e}"))
        };
        let mut object = serde_json::to_value(&*self).map_err(invalid)?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        if let serde_json::Value::Object(map) = &mut object {
            map.insert(key.to_string(), value);
        }
        *self = serde_json::from_value(object).map_err(invalid)?;
        Ok(())
    }

    /// Checks option ranges and mutually exclusive options.
    pub fn validate(&self) -> Result<(), DdlError> {
        let invalid = |msg: String| Err(DdlError::InvalidMigrationConfig(msg));
        if !(100..=100_000).contains(&self.chunk_size) {
            return invalid(format!(
                "chunk-size must be within [100, 100000], got {}",
                self.chunk_size
            ));
        }
        if !(1..=100).contains(&self.dml_batch_size) {
            return invalid(format!(
                "dml-batch-size must be within [1, 100], got {}",
                self.dml_batch_size
            ));
        }
        if !(self.nice_ratio >= 0.0) {
            return invalid(format!(
                "nice-ratio must not be negative, got {}",
                self.nice_ratio
            ));
        }
        if self.heartbeat_interval_millis == 0 || self.default_retries == 0 {
            return invalid("heartbeat-interval-millis and default-retries must be positive".into());
        }
        if !(1..=10).contains(&self.cut_over_lock_timeout_seconds) {
            return invalid(format!(
                "cut-over-lock-timeout-seconds must be within [1, 10], got {}",
                self.cut_over_lock_timeout_seconds
            ));
        }
        if self.switch_to_rbr && self.assume_rbr {
            return invalid("switch-to-rbr and assume-rbr are mutually exclusive".into());
        }
        if self.test_on_replica && self.migrate_on_replica {
            return invalid("test-on-replica and migrate-on-replica are mutually exclusive".into());
        }
        if (self.test_on_replica || self.migrate_on_replica) && self.allow_on_master {
            return invalid("allow-on-master cannot be combined with replica migrations".into());
        }
        if self.throttle_http.is_some()
            && (self.throttle_http_interval_millis == 0 || self.throttle_http_timeout_millis == 0)
        {
            return invalid("throttle-http needs a positive interval and timeout".into());
        }
        if !matches!(self.storage_engine.as_str(), "innodb" | "rocksdb") {
            return invalid(format!(
                "storage-engine must be innodb or rocksdb, got {}",
                self.storage_engine
            ));
        }
        Ok(())
    }
}

/// Throttling options that a running task picks up on SIGHUP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MigrationOverrides {
    /// See [`MigrationConfig::chunk_size`].
    pub chunk_size: Option<u64>,
    /// See [`MigrationConfig::dml_batch_size`].
    pub dml_batch_size: Option<u64>,
    /// See [`MigrationConfig::nice_ratio`].
    pub nice_ratio: Option<f64>,
    /// See [`MigrationConfig::max_lag_millis`].
    pub max_lag_millis: Option<u64>,
    /// See [`MigrationConfig::max_load`].
    pub max_load: Option<String>,
}

impl MigrationOverrides {
    /// Returns the control socket commands that apply the overrides.
    pub fn commands(&self) -> Vec<String> {
        let mut commands = Vec::new();
        if let Some(v) = self.chunk_size {
            commands.push(format!("chunk-size={v}"));
        }
        if let Some(v) = self.dml_batch_size {
            commands.push(format!("dml-batch-size={v}"));
        }
        if let Some(v) = self.nice_ratio {
            commands.push(format!("nice-ratio={v}"));
        }
        if let Some(v) = self.max_lag_millis {
            commands.push(format!("max-lag-millis={v}"));
        }
        if let Some(v) = &self.max_load {
            commands.push(format!("max-load={v}"));
        }
        commands
    }
}

/// Returns the replica server id a task of batch `bill_id` registers on
/// `shard`.
pub fn replica_server_id(bill_id: u64, shard: u32) -> u32 {
    (1_000_000_000 + (bill_id % 1_000_000) * 1000 + u64::from(shard % 1000)) as u32
}

/// Migration of one table on one shard.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct MigrationTask {
    /// The batch.
    pub bill_id: u64,
    /// Position of the statement in the batch.
    pub ordinal: usize,
    /// The shard.
    pub shard: u32,
    /// The shard master.
    pub instance: Instance,
    /// Physical database name.
    pub database: String,
    /// The table.
    pub table: String,
    /// The alter specification.
    pub alter: String,
    /// Control socket of the engine.
    pub socket_file: PathBuf,
    /// Replica server id the engine registers with.
    pub server_id: u32,
    #[derivative(Debug = "ignore")]
    config: Arc<MigrationConfig>,
}

/// Longest control socket path that fits in `sun_path` with its terminating
/// NUL.
pub const MAX_SOCKET_PATH_LEN: usize = 107;

impl MigrationTask {
    /// Creates the task migrating `logical_db.table` on the shard served by
    /// `instance`.
    pub fn new(
        bill_id: u64,
        ordinal: usize,
        instance: &Instance,
        logical_db: &str,
        table: &str,
        alter: &str,
        config: Arc<MigrationConfig>,
    ) -> Result<MigrationTask, DdlError> {
        let shard = instance.shard().ok_or_else(|| {
            DdlError::TopologyUnavailable(format!("{instance} is not a backend shard"))
        })?;
        let database = shard_physical_name(logical_db, shard);
        let socket_file = config.socket_dir.join(format!(
            "gh-ost.{bill_id}.{ordinal}.{shard}.{database}.{table}.sock"
        ));
        let len = socket_file.as_os_str().len();
        if len > MAX_SOCKET_PATH_LEN {
            return Err(DdlError::SocketPathTooLong {
                path: socket_file,
                len,
                limit: MAX_SOCKET_PATH_LEN,
            });
        }
        Ok(MigrationTask {
            bill_id,
            ordinal,
            shard,
            instance: instance.clone(),
            database,
            table: table.to_string(),
            alter: alter.to_string(),
            socket_file,
            server_id: replica_server_id(bill_id, shard),
            config,
        })
    }

    /// Names the task in logs and reload files.
    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            self.bill_id, self.ordinal, self.shard, self.database, self.table
        )
    }

    /// The batch's engine options.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Returns the file read for overrides when the process receives SIGHUP.
    pub fn reload_file(&self) -> Option<PathBuf> {
        let dir = self.config.reload_dir.as_ref()?;
        Some(dir.join(format!("{}.json", self.name())))
    }

    /// Returns the engine's arguments. With `redact`, the password is
    /// replaced by a marker.
    pub fn args(&self, redact: bool) -> Vec<String> {
        let c = &self.config;
        let password = if redact {
            REDACTED
        } else {
            self.instance.credentials.password.as_str()
        };
        let mut args = vec![
            format!("--host={}", self.instance.host),
            format!("--port={}", self.instance.port),
            format!("--user={}", self.instance.credentials.user),
            format!("--password={password}"),
            format!("--database={}", self.database),
            format!("--table={}", self.table),
            format!("--alter={}", self.alter),
            format!("--chunk-size={}", c.chunk_size),
            format!("--dml-batch-size={}", c.dml_batch_size),
            format!("--heartbeat-interval-millis={}", c.heartbeat_interval_millis),
            format!("--nice-ratio={}", c.nice_ratio),
            format!("--max-lag-millis={}", c.max_lag_millis),
            format!("--default-retries={}", c.default_retries),
            format!("--cut-over-lock-timeout-seconds={}", c.cut_over_lock_timeout_seconds),
            format!("--exponential-backoff-max-interval={}", c.exponential_backoff_max_interval),
            format!("--storage-engine={}", c.storage_engine),
            format!("--serve-socket-file={}", self.socket_file.display()),
            format!("--replica-server-id={}", self.server_id),
            format!("--concurrent-rowcount={}", c.concurrent_rowcount),
            format!("--timestamp-old-table={}", c.timestamp_old_table),
            "--cut-over=atomic".into(),
            "--initially-drop-ghost-table".into(),
            "--initially-drop-old-table".into(),
        ];
        if let Some(max_load) = &c.max_load {
            args.push(format!("--max-load={max_load}"));
        }
        if let Some(url) = &c.throttle_http {
            args.push(format!("--throttle-http={url}"));
            args.push(format!("--throttle-http-interval-millis={}", c.throttle_http_interval_millis));
            args.push(format!("--throttle-http-timeout-millis={}", c.throttle_http_timeout_millis));
        }
        for (enabled, flag) in [
            (c.allow_on_master, "--allow-on-master"),
            (c.switch_to_rbr, "--switch-to-rbr"),
            (c.assume_rbr, "--assume-rbr"),
            (c.test_on_replica, "--test-on-replica"),
            (c.migrate_on_replica, "--migrate-on-replica"),
        ] {
            if enabled {
                args.push(flag.into());
            }
        }
        args.push("--execute".into());
        args
    }

    /// Renders the equivalent shell invocation, password redacted.
    pub fn command_line(&self) -> String {
        command_line(&self.config.ghost_binary.to_string_lossy(), self.args(true))
    }
}

/// Lifecycle of a migration task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationState {
    /// Not started.
    Constructed,
    /// Inspecting the table and the replication setup.
    Inspecting,
    /// Copying rows and applying the binlog.
    RowCopying,
    /// Rows copied; waiting to swap tables.
    CutoverPending,
    /// Tables swapped.
    CutoverDone,
    /// The engine failed.
    Failed,
    /// The engine was told to abort.
    Aborted,
}

impl MigrationState {
    /// Advances the state from one line of engine output. States never move
    /// backwards, and terminal states are left only by the runner.
    pub fn observe(self, line: &str) -> MigrationState {
        let next = if line.contains("Done migrating") {
            MigrationState::CutoverDone
        } else if line.contains("Row copy complete") {
            MigrationState::CutoverPending
        } else if line.starts_with("Copy:") || line.contains("# Migrating") {
            MigrationState::RowCopying
        } else if line.contains("Inspector initiated") || line.contains("Inspecting") {
            MigrationState::Inspecting
        } else {
            return self;
        };
        if self.is_terminal() || next <= self {
            self
        } else {
            next
        }
    }

    /// Reports whether the task has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::CutoverDone | MigrationState::Failed | MigrationState::Aborted
        )
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Runs the migration of one table on one shard.
#[async_trait]
pub trait ShardMigrator: fmt::Debug + Send + Sync {
    /// Migrates `task` to completion. When `cancel` fires the migration is
    /// told to abort and the call returns an error once it has stopped.
    async fn migrate(
        &self,
        task: MigrationTask,
        cancel: CancellationToken,
    ) -> Result<MigrationState, anyhow::Error>;
}

/// Runs `tasks` with at most `parallelism` of them at once and waits for all
/// of them.
pub async fn migrate_shards(
    migrator: Arc<dyn ShardMigrator>,
    tasks: Vec<MigrationTask>,
    parallelism: usize,
    cancel: &CancellationToken,
) -> Result<(), DdlError> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut set = JoinSet::new();
    info!(tasks = tasks.len(), parallelism, "migrating shards");
    for task in tasks {
        let semaphore = Arc::clone(&semaphore);
        let migrator = Arc::clone(&migrator);
        let cancel = cancel.clone();
        let name = task.name();
        let on_error = ShardFailure {
            shard: task.shard,
            instance: task.instance.address(),
            db: task.database.clone(),
            table: task.table.clone(),
            error: String::new(),
        };
        set.spawn_named(
            || format!("migrate:{name}"),
            async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(ShardFailure {
                        error: "migration pool closed".into(),
                        ..on_error
                    });
                };
                if cancel.is_cancelled() {
                    return Err(ShardFailure {
                        error: "cancelled before start".into(),
                        ..on_error
                    });
                }
                let res = AssertUnwindSafe(migrator.migrate(task, cancel))
                    .catch_unwind()
                    .await;
                match res {
                    Ok(Ok(state)) => {
                        info!(%state, "shard migrated");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(ShardFailure {
                        error: format!("{e:#}"),
                        ..on_error
                    }),
                    Err(_) => Err(ShardFailure {
                        error: "migration task panicked".into(),
                        ..on_error
                    }),
                }
            },
        );
    }

    let mut failures = Vec::new();
    while let Some(res) = set.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => {
                warn!("{failure}");
                failures.push(failure);
            }
            Err(e) => failures.push(ShardFailure {
                shard: u32::MAX,
                instance: String::new(),
                db: String::new(),
                table: String::new(),
                error: e.to_string(),
            }),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        failures.sort_by_key(|f| f.shard);
        Err(DdlError::ShardMigrationFailed(failures))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::topology::{Credentials, InstanceRole};

    fn shard(n: u32) -> Instance {
        Instance::new(
            format!("SPT{n}"),
            format!("10.0.0.{n}"),
            20000,
            Credentials {
                user: "ddl".into(),
                password: "hunter2".into(),
            },
            InstanceRole::BackendMaster { shard: n },
        )
    }

    fn task(n: u32, config: &Arc<MigrationConfig>) -> MigrationTask {
        MigrationTask::new(7, 1, &shard(n), "db1", "t1", "ADD c INT", Arc::clone(config)).unwrap()
    }

    #[derive(Debug, Default)]
    struct CountingMigrator {
        fail: BTreeSet<u32>,
        running: Mutex<(usize, usize)>,
    }

    #[async_trait]
    impl ShardMigrator for CountingMigrator {
        async fn migrate(
            &self,
            task: MigrationTask,
            _: CancellationToken,
        ) -> Result<MigrationState, anyhow::Error> {
            {
                let mut running = self.running.lock().unwrap();
                running.0 += 1;
                running.1 = running.1.max(running.0);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.lock().unwrap().0 -= 1;
            if self.fail.contains(&task.shard) {
                anyhow::bail!("engine exited with status 1");
            }
            Ok(MigrationState::CutoverDone)
        }
    }

    #[test]
    fn test_config_set() {
        let mut config = MigrationConfig::default();
        config.set("chunk-size", "500").unwrap();
        config.set("allow-on-master", "true").unwrap();
        config.set("max-load", "Threads_running=25").unwrap();
        config.set("ghost-binary", "/usr/local/bin/gh-ost").unwrap();
        assert_eq!(config.chunk_size, 500);
        assert!(config.allow_on_master);
        assert_eq!(config.max_load.as_deref(), Some("Threads_running=25"));
        assert_eq!(config.ghost_binary, PathBuf::from("/usr/local/bin/gh-ost"));

        assert!(config.set("chunk_size", "500").is_err());
        assert!(config.set("chunk-size", "lots").is_err());
        assert_eq!(config.chunk_size, 500);
    }

    #[test]
    fn test_config_validate() {
        MigrationConfig::default().validate().unwrap();
        for (key, value) in [
            ("chunk-size", "10"),
            ("dml-batch-size", "0"),
            ("nice-ratio", "-1"),
            ("cut-over-lock-timeout-seconds", "30"),
            ("storage-engine", "myisam"),
        ] {
            let mut config = MigrationConfig::default();
            config.set(key, value).unwrap();
            assert!(config.validate().is_err(), "{key}={value}");
        }
        let config = MigrationConfig {
            switch_to_rbr: true,
            assume_rbr: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = MigrationConfig {
            test_on_replica: true,
            migrate_on_replica: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socket_path_limit() {
        let config = Arc::new(MigrationConfig {
            socket_dir: PathBuf::from("/data/ddl"),
            ..Default::default()
        });
        let db = "d".repeat(64);
        let table = "t".repeat(64);
        let err = MigrationTask::new(7, 1, &shard(3), &db, &table, "ADD c INT", Arc::clone(&config))
            .unwrap_err();
        match err {
            DdlError::SocketPathTooLong { path, len, limit } => {
                assert_eq!(limit, MAX_SOCKET_PATH_LEN);
                assert_eq!(len, path.as_os_str().len());
                assert!(len > limit);
            }
            other => panic!("unexpected error: {other}"),
        }

        let table = "t".repeat(66);
        let task = MigrationTask::new(7, 1, &shard(3), "db1", &table, "ADD c INT", config).unwrap();
        assert!(task.socket_file.as_os_str().len() <= MAX_SOCKET_PATH_LEN);
    }

    #[test]
    fn test_server_id() {
        assert_eq!(replica_server_id(0, 0), 1_000_000_000);
        assert_eq!(replica_server_id(123, 4), 1_000_123_004);
        assert_eq!(replica_server_id(1_000_123, 1004), 1_000_123_004);
        assert_eq!(replica_server_id(999_999, 999), 1_999_999_999);
    }

    #[test]
    fn test_task_args_and_command_line() {
        let config = Arc::new(MigrationConfig {
            socket_dir: PathBuf::from("/data/ddl"),
            reload_dir: Some(PathBuf::from("/data/reload")),
            ..Default::default()
        });
        let task = task(3, &config);
        assert_eq!(task.database, "db1_3");
        assert_eq!(
            task.socket_file,
            PathBuf::from("/data/ddl/gh-ost.7.1.3.db1_3.t1.sock")
        );
        assert_eq!(
            task.reload_file(),
            Some(PathBuf::from("/data/reload/7.1.3.db1_3.t1.json"))
        );
        let args = task.args(false);
        assert!(args.contains(&"--password=hunter2".to_string()));
        assert!(args.contains(&"--alter=ADD c INT".to_string()));
        assert!(!args.contains(&"--allow-on-master".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--execute"));

        let line = task.command_line();
        assert!(line.contains("--alter='ADD c INT'") || line.contains("'--alter=ADD c INT'"));
        assert!(!line.contains("hunter2"));
        assert!(line.contains(REDACTED));
        assert!(!format!("{task:?}").contains("hunter2"));
    }

    #[test]
    fn test_state_transitions() {
        use MigrationState::*;
        let lines = [
            "2024-01-01 INFO starting",
            "2024-01-01 INFO Inspector initiated on host:20000",
            "# Migrating `db1_0`.`t1`; Ghost table is `db1_0`.`_t1_gho`",
            "Copy: 0/100 0.0%; Applied: 0",
            "2024-01-01 INFO Inspecting again",
            "2024-01-01 INFO Row copy complete",
            "Copy: 100/100 100.0%; Applied: 3",
            "# Done migrating `db1_0`.`t1`",
        ];
        let states: Vec<_> = lines
            .iter()
            .scan(Constructed, |state, line| {
                *state = state.observe(line);
                Some(*state)
            })
            .collect();
        assert_eq!(
            states,
            vec![
                Constructed,
                Inspecting,
                RowCopying,
                RowCopying,
                RowCopying,
                CutoverPending,
                CutoverPending,
                CutoverDone
            ]
        );
        assert_eq!(Failed.observe("# Done migrating"), Failed);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let config = Arc::new(MigrationConfig::default());
        let migrator = Arc::new(CountingMigrator::default());
        let tasks = (0..8).map(|n| task(n, &config)).collect();
        migrate_shards(
            Arc::clone(&migrator) as Arc<dyn ShardMigrator>,
            tasks,
            3,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let (running, peak) = *migrator.running.lock().unwrap();
        assert_eq!(running, 0);
        assert!(peak <= 3 && peak >= 1, "peak {peak}");
    }

    #[tokio::test]
    async fn test_all_failures_reported() {
        let config = Arc::new(MigrationConfig::default());
        let migrator = Arc::new(CountingMigrator {
            fail: [1, 3].into(),
            ..Default::default()
        });
        let tasks = (0..4).map(|n| task(n, &config)).collect();
        let err = migrate_shards(migrator, tasks, 4, &CancellationToken::new())
            .await
            .unwrap_err();
        let DdlError::ShardMigrationFailed(failures) = err else {
            panic!("unexpected error {err}");
        };
        let shards: Vec<_> = failures.iter().map(|f| f.shard).collect();
        assert_eq!(shards, vec![1, 3]);
        assert_eq!(failures[0].db, "db1_1");
        assert!(failures[0].error.contains("status 1"));
    }

    #[tokio::test]
    async fn test_cancelled_tasks_do_not_start() {
        let config = Arc::new(MigrationConfig::default());
        let migrator = Arc::new(CountingMigrator::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tasks = (0..2).map(|n| task(n, &config)).collect();
        let err = migrate_shards(
            Arc::clone(&migrator) as Arc<dyn ShardMigrator>,
            tasks,
            2,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DdlError::ShardMigrationFailed(f) if f.len() == 2));
        assert_eq!(migrator.running.lock().unwrap().1, 0);
    }
}
