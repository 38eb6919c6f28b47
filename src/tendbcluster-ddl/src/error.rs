// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors surfaced by a DDL batch.

use std::fmt;
use std::path::PathBuf;

use dbm_mysql_util::MySqlError;
use itertools::Itertools;

/// A SQL file could not be split into statements.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{file}:{line}: {message}")]
pub struct ParseError {
    /// The file the statement came from.
    pub file: String,
    /// One-based line of the offending token.
    pub line: usize,
    /// What went wrong.
    pub message: String,
}

impl ParseError {
    /// Creates a parse error.
    pub fn new(file: &str, line: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

/// A (file, database) pair that two batch items would both apply on a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateObject {
    /// The shard where the collision was found.
    pub shard: u32,
    /// The SQL file named by both items.
    pub file: String,
    /// The logical database both items expanded to.
    pub db: String,
    /// The item that claimed the pair first.
    pub first_line_id: u32,
    /// The item that claimed it again.
    pub line_id: u32,
}

impl fmt::Display for DuplicateObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard {}: file {} on database {} is requested by items {} and {}",
            self.shard, self.file, self.db, self.first_line_id, self.line_id
        )
    }
}

/// One reason the blocking precheck refused to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrecheckFailure {
    /// The instance could not be reached or refused the session setup.
    Unreachable {
        /// `name(host:port)` of the instance.
        instance: String,
        /// The underlying error.
        error: String,
    },
    /// A long running session references a table that is about to change.
    BlockedByProcess {
        /// `name(host:port)` of the instance.
        instance: String,
        /// The table name found in the session's statement.
        table: String,
        /// Process list id of the session.
        process_id: u64,
        /// Owner of the session.
        user: String,
        /// Seconds the statement has been running.
        time: i64,
        /// The statement text.
        info: String,
    },
    /// `FLUSH TABLES ... WITH READ LOCK` failed for a group of tables.
    BlockedByLock {
        /// `name(host:port)` of the instance.
        instance: String,
        /// Qualified `db.table` names in the failing group.
        tables: Vec<String>,
        /// The server error.
        error: String,
    },
}

impl fmt::Display for PrecheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrecheckFailure::Unreachable { instance, error } => {
                write!(f, "{instance}: unreachable: {error}")
            }
            PrecheckFailure::BlockedByProcess {
                instance,
                table,
                process_id,
                user,
                time,
                info,
            } => write!(
                f,
                "{instance}: process {process_id} of {user} has been running for {time}s \
                 and references table {table}: {info}"
            ),
            PrecheckFailure::BlockedByLock {
                instance,
                tables,
                error,
            } => write!(
                f,
                "{instance}: cannot flush [{}] with read lock: {error}",
                tables.join(", ")
            ),
        }
    }
}

/// A shard whose migration did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    /// The shard number.
    pub shard: u32,
    /// `host:port` of the shard master.
    pub instance: String,
    /// Physical database name on the shard.
    pub db: String,
    /// The migrated table.
    pub table: String,
    /// The migration error, with causes.
    pub error: String,
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard {} ({}) {}.{}: {}",
            self.shard, self.instance, self.db, self.table, self.error
        )
    }
}

/// Everything that can make a DDL batch fail.
#[derive(Debug, thiserror::Error)]
pub enum DdlError {
    /// The cluster layout could not be read or an element did not respond.
    #[error("topology unavailable: {0}")]
    TopologyUnavailable(String),
    /// The catalogue no longer matches the layout the batch started with.
    #[error("cluster topology changed during the batch: {0}")]
    TopologyChanged(String),
    /// A SQL file is malformed.
    #[error("malformed sql: {0}")]
    ParseError(#[from] ParseError),
    /// A database name pattern is not valid.
    #[error("invalid database pattern {pattern:?}: {error}")]
    InvalidPattern {
        /// The pattern as given.
        pattern: String,
        /// Why it was rejected.
        error: String,
    },
    /// A batch item resolved to no database.
    #[error(
        "item {line_id} matched no database: dbnames {intention:?}, ignore_dbnames {ignore:?}"
    )]
    NoMatchedDatabase {
        /// The offending item.
        line_id: u32,
        /// Its inclusion patterns.
        intention: Vec<String>,
        /// Its exclusion patterns.
        ignore: Vec<String>,
    },
    /// Shards disagree on which logical databases an item expands to.
    #[error("shard {shard} expands item {line_id} to {actual:?}, shard {reference_shard} to {expected:?}")]
    ShardPlanMismatch {
        /// The item.
        line_id: u32,
        /// The shard whose expansion is used as reference.
        reference_shard: u32,
        /// The reference expansion.
        expected: Vec<String>,
        /// The shard that disagrees.
        shard: u32,
        /// Its expansion.
        actual: Vec<String>,
    },
    /// Two items would apply the same file to the same database.
    #[error("duplicate objects across batch items:\n{}", render_lines(.0))]
    DuplicateObjectAcrossBatch(Vec<DuplicateObject>),
    /// The blocking precheck found at least one problem.
    #[error("precheck failed:\n{}", render_lines(.0))]
    PrecheckFailed(Vec<PrecheckFailure>),
    /// The row-copy configuration is inconsistent.
    #[error("invalid migration config: {0}")]
    InvalidMigrationConfig(String),
    /// The replica server id a migration would register is already taken.
    #[error("replica server id {server_id} is already in use around {instance}")]
    ServerIdCollision {
        /// `host:port` of the shard master.
        instance: String,
        /// The colliding id.
        server_id: u32,
    },
    /// A migration control socket already exists.
    #[error("control socket {} already exists", .0.display())]
    SocketCollision(PathBuf),
    /// A migration control socket path does not fit in a `sockaddr_un`.
    #[error("control socket path {} is {len} bytes, longer than {limit}", path.display())]
    SocketPathTooLong {
        /// The rejected path.
        path: PathBuf,
        /// Its length in bytes.
        len: usize,
        /// The longest usable path.
        limit: usize,
    },
    /// At least one shard failed to migrate.
    #[error("shard migration failed:\n{}", render_lines(.0))]
    ShardMigrationFailed(Vec<ShardFailure>),
    /// A router rejected the statement. Shards may already carry the change.
    #[error("router {name} ({host}:{port}) failed to apply statement: {error}")]
    RouterApplyFailed {
        /// Catalogue name of the router.
        name: String,
        /// Router host.
        host: String,
        /// Router port.
        port: u16,
        /// The server error.
        #[source]
        error: MySqlError,
    },
    /// The coordinator rejected the statement after the other tiers applied it.
    #[error("coordinator {host}:{port} failed to apply statement: {error}")]
    CoordinatorApplyFailed {
        /// Coordinator host.
        host: String,
        /// Coordinator port.
        port: u16,
        /// The server error.
        #[source]
        error: MySqlError,
    },
    /// A session needed by the batch could not be established or used.
    #[error("{context}: {error}")]
    MySql {
        /// What the session was for.
        context: String,
        /// The underlying error.
        #[source]
        error: MySqlError,
    },
    /// A local file could not be read or written.
    #[error("{}: {error}", .path.display())]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
    /// The batch was cancelled.
    #[error("batch cancelled")]
    Cancelled,
}

impl DdlError {
    /// Wraps a MySQL error with what the session was doing.
    pub fn mysql(context: impl Into<String>, error: MySqlError) -> DdlError {
        DdlError::MySql {
            context: context.into(),
            error,
        }
    }

    /// Wraps an I/O error with the path involved.
    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> DdlError {
        DdlError::Io {
            path: path.into(),
            error,
        }
    }
}

fn render_lines<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|item| format!("  {item}")).join("\n")
}
