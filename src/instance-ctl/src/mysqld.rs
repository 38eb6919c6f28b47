// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An [`InstanceController`] for `mysqld` processes on the local host.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use derivative::Derivative;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{InstanceController, InstanceTarget};

/// Drives local `mysqld` instances with the stock server tooling.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct MysqldController {
    /// Path to `mysqladmin`.
    pub mysqladmin: PathBuf,
    /// Path to `mysqld_safe`.
    pub mysqld_safe: PathBuf,
    /// The OS user `mysqld_safe` runs the server as.
    pub os_user: String,
    /// Administrative account used for graceful shutdown.
    pub admin_user: String,
    #[derivative(Debug = "ignore")]
    pub admin_password: String,
}

#[async_trait]
impl InstanceController for MysqldController {
    async fn is_running(&self, target: &InstanceTarget) -> Result<bool, anyhow::Error> {
        // A listening socket is the only signal that the server is serving;
        // a live pid may still be recovering or already shutting down.
        match UnixStream::connect(&target.socket).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(%target, "socket not accepting connections: {e}");
                Ok(false)
            }
        }
    }

    async fn shutdown(&self, target: &InstanceTarget) -> Result<(), anyhow::Error> {
        info!(%target, "requesting graceful shutdown");
        let output = Command::new(&self.mysqladmin)
            .arg(format!("--socket={}", target.socket.display()))
            .arg(format!("--user={}", self.admin_user))
            .arg(format!("--password={}", self.admin_password))
            .arg("shutdown")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running {}", self.mysqladmin.display()))?;
        if !output.status.success() {
            bail!(
                "mysqladmin shutdown exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn kill(&self, target: &InstanceTarget) -> Result<(), anyhow::Error> {
        let pid_file = target
            .pid_file
            .as_ref()
            .ok_or_else(|| anyhow!("no pid-file configured in {}", target.defaults_file.display()))?;
        let pid = tokio::fs::read_to_string(pid_file)
            .await
            .with_context(|| format!("reading {}", pid_file.display()))?;
        let pid: i32 = pid
            .trim()
            .parse()
            .with_context(|| format!("parsing pid from {}", pid_file.display()))?;
        info!(%target, pid, "killing instance");
        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                info!(%target, pid, "process already gone");
                Ok(())
            }
            Err(e) => Err(anyhow!("sending SIGKILL to {pid}: {e}")),
        }
    }

    async fn start(&self, target: &InstanceTarget) -> Result<(), anyhow::Error> {
        info!(%target, "starting instance");
        // `mysqld_safe` supervises the server for its whole lifetime, so it
        // is spawned detached and never awaited.
        Command::new(&self.mysqld_safe)
            .arg(format!("--defaults-file={}", target.defaults_file.display()))
            .arg(format!("--user={}", self.os_user))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {}", self.mysqld_safe.display()))?;
        Ok(())
    }
}
