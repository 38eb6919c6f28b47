// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Applies statements on routers and on the coordinator.

use dbm_mysql_util::{MySqlError, quote_identifier};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DdlError;
use crate::session::{Connector, Session, close};
use crate::topology::Instance;

/// Keeps a newer-family router from forwarding the statement to the
/// coordinator.
pub const DISABLE_DDL_FORWARDING: &str = "SET SESSION ddl_execute_by_ctl = OFF";

/// How the coordinator treats a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorMode {
    /// Record the statement locally. Used to close an `ALTER` that the
    /// shards and routers already carry.
    LocalOnly,
    /// Dispatch the statement to the whole cluster.
    Dispatch,
}

impl CoordinatorMode {
    fn session_setting(&self) -> &'static str {
        match self {
            CoordinatorMode::LocalOnly => "SET SESSION tc_admin = 0",
            CoordinatorMode::Dispatch => "SET SESSION tc_admin = 1",
        }
    }
}

/// Runs `sql` on every router in order, stopping at the first failure.
///
/// Cancellation is honored between routers, never in the middle of one.
pub async fn apply_on_routers(
    connector: &dyn Connector,
    routers: &[Instance],
    db: Option<&str>,
    sql: &str,
    cancel: &CancellationToken,
) -> Result<(), DdlError> {
    for router in routers {
        if cancel.is_cancelled() {
            return Err(DdlError::Cancelled);
        }
        let mut prelude = Vec::new();
        if router.disables_ddl_forwarding() {
            prelude.push(DISABLE_DDL_FORWARDING.to_string());
        }
        apply(connector, router, "router-apply", &prelude, db, sql)
            .await
            .map_err(|error| DdlError::RouterApplyFailed {
                name: router.name.clone(),
                host: router.host.clone(),
                port: router.port,
                error,
            })?;
        info!(router = %router, "applied statement on router");
    }
    Ok(())
}

/// Runs `sql` on the coordinator in `mode`.
pub async fn apply_on_coordinator(
    connector: &dyn Connector,
    coordinator: &Instance,
    mode: CoordinatorMode,
    db: Option<&str>,
    sql: &str,
) -> Result<(), DdlError> {
    let prelude = [mode.session_setting().to_string()];
    apply(connector, coordinator, "coordinator-apply", &prelude, db, sql)
        .await
        .map_err(|error| DdlError::CoordinatorApplyFailed {
            host: coordinator.host.clone(),
            port: coordinator.port,
            error,
        })?;
    info!(coordinator = %coordinator, ?mode, "applied statement on coordinator");
    Ok(())
}

async fn apply(
    connector: &dyn Connector,
    instance: &Instance,
    purpose: &str,
    prelude: &[String],
    db: Option<&str>,
    sql: &str,
) -> Result<(), MySqlError> {
    let mut session = connector.connect(instance, purpose).await?;
    let res = run(session.as_mut(), prelude, db, sql).await;
    close(session).await;
    res
}

async fn run(
    session: &mut dyn Session,
    prelude: &[String],
    db: Option<&str>,
    sql: &str,
) -> Result<(), MySqlError> {
    for stmt in prelude {
        session.execute(stmt).await?;
    }
    if let Some(db) = db {
        session.execute(&format!("USE {}", quote_identifier(db))).await?;
    }
    session.execute(sql).await
}
