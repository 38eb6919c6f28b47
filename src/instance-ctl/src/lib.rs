// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Restart-in-place of MySQL instances.
//!
//! The [`restart_in_place`] driver bounces a list of instances one at a
//! time: a graceful stop bounded by a timeout, an optional force kill when
//! the graceful stop does not finish, and a start that waits for the instance
//! to accept connections again. How an instance is actually stopped, killed
//! and started is delegated to an [`InstanceController`], so the same driver
//! works against local `mysqld` processes (see [`mysqld::MysqldController`])
//! or any other backend.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dbm_ore::retry::{Retry, RetryResult};
use tracing::{info, warn};

pub mod mycnf;
pub mod mysqld;

use crate::mycnf::MysqldDefaults;

/// An instance to restart, with the runtime files discovered from its own
/// defaults file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub port: u16,
    pub defaults_file: PathBuf,
    pub socket: PathBuf,
    pub pid_file: Option<PathBuf>,
}

impl InstanceTarget {
    /// Builds a target by reading the `[mysqld]` section of `defaults_file`.
    pub fn from_defaults_file(
        port: u16,
        defaults_file: impl AsRef<Path>,
    ) -> Result<InstanceTarget, mycnf::Error> {
        let defaults_file = defaults_file.as_ref();
        let defaults = MysqldDefaults::read(defaults_file)?;
        if let Some(configured) = defaults.port {
            if configured != port {
                warn!(
                    port,
                    configured,
                    defaults_file = %defaults_file.display(),
                    "defaults file configures a different port"
                );
            }
        }
        Ok(InstanceTarget {
            port,
            defaults_file: defaults_file.to_path_buf(),
            socket: defaults.socket,
            pid_file: defaults.pid_file,
        })
    }
}

impl fmt::Display for InstanceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {} ({})", self.port, self.socket.display())
    }
}

/// Controls the lifecycle of a single instance.
///
/// Implementations must not block: a graceful shutdown that hangs is
/// detected by the driver's timeout, not by the controller.
#[async_trait]
pub trait InstanceController: fmt::Debug + Send + Sync {
    /// Reports whether the instance currently accepts connections.
    async fn is_running(&self, target: &InstanceTarget) -> Result<bool, anyhow::Error>;

    /// Requests a graceful shutdown.
    async fn shutdown(&self, target: &InstanceTarget) -> Result<(), anyhow::Error>;

    /// Kills the instance without waiting for it to shut down cleanly.
    async fn kill(&self, target: &InstanceTarget) -> Result<(), anyhow::Error>;

    /// Starts the instance. Returning does not imply the instance is up.
    async fn start(&self, target: &InstanceTarget) -> Result<(), anyhow::Error>;
}

/// Policy knobs for [`restart_in_place`].
#[derive(Debug, Clone)]
pub struct RestartOptions {
    /// Kill an instance whose graceful shutdown fails or times out.
    pub force_shutdown: bool,
    /// Fail a target that is already stopped instead of starting it.
    pub abort_when_stopped: bool,
    /// Keep going with the remaining targets after one fails.
    pub continue_on_other_instance_error: bool,
    pub shutdown_timeout: Duration,
    pub start_timeout: Duration,
    /// How often the instance state is polled while waiting.
    pub poll_interval: Duration,
}

impl Default for RestartOptions {
    fn default() -> Self {
        RestartOptions {
            force_shutdown: false,
            abort_when_stopped: false,
            continue_on_other_instance_error: false,
            shutdown_timeout: Duration::from_secs(60),
            start_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Why a single target could not be restarted.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("instance is already stopped")]
    AlreadyStopped,
    #[error("checking instance status: {0:#}")]
    Status(anyhow::Error),
    #[error("graceful shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("graceful shutdown failed: {0:#}")]
    Shutdown(anyhow::Error),
    #[error("force kill failed: {0:#}")]
    Kill(anyhow::Error),
    #[error("instance still running {0:?} after force kill")]
    KillTimeout(Duration),
    #[error("start failed: {0:#}")]
    Start(anyhow::Error),
    #[error("instance did not come up within {0:?}")]
    StartTimeout(Duration),
}

/// A failure of one target.
#[derive(Debug)]
pub struct InstanceFailure {
    pub port: u16,
    pub error: InstanceError,
}

/// The joined failures of a [`restart_in_place`] run.
#[derive(Debug, thiserror::Error)]
#[error("restart failed for {} instance(s){}", failures.len(), render_failures(failures))]
pub struct RestartError {
    pub failures: Vec<InstanceFailure>,
}

fn render_failures(failures: &[InstanceFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("\n  port {}: {}", f.port, f.error))
        .collect()
}

/// Restarts every target in order.
///
/// Errors are joined across targets. When
/// [`RestartOptions::continue_on_other_instance_error`] is false the driver
/// stops at the first failing target and later targets are not touched.
pub async fn restart_in_place(
    controller: &dyn InstanceController,
    targets: &[InstanceTarget],
    options: &RestartOptions,
) -> Result<(), RestartError> {
    let mut failures = vec![];
    for target in targets {
        info!(%target, "restarting instance");
        match restart_one(controller, target, options).await {
            Ok(()) => info!(%target, "instance restarted"),
            Err(error) => {
                warn!(%target, "restart failed: {error}");
                failures.push(InstanceFailure {
                    port: target.port,
                    error,
                });
                if !options.continue_on_other_instance_error {
                    break;
                }
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(RestartError { failures })
    }
}

async fn restart_one(
    controller: &dyn InstanceController,
    target: &InstanceTarget,
    options: &RestartOptions,
) -> Result<(), InstanceError> {
    let running = controller
        .is_running(target)
        .await
        .map_err(InstanceError::Status)?;
    if running {
        stop(controller, target, options).await?;
    } else if options.abort_when_stopped {
        return Err(InstanceError::AlreadyStopped);
    } else {
        info!(%target, "instance already stopped, starting it");
    }

    controller
        .start(target)
        .await
        .map_err(InstanceError::Start)?;
    wait_for_state(controller, target, true, options.start_timeout, options)
        .await
        .map_err(|e| e.unwrap_or(InstanceError::StartTimeout(options.start_timeout)))
}

async fn stop(
    controller: &dyn InstanceController,
    target: &InstanceTarget,
    options: &RestartOptions,
) -> Result<(), InstanceError> {
    let graceful = async {
        controller
            .shutdown(target)
            .await
            .map_err(|e| Some(InstanceError::Shutdown(e)))?;
        wait_for_state(controller, target, false, options.shutdown_timeout, options).await
    };
    let error = match tokio::time::timeout(options.shutdown_timeout, graceful).await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(Some(e))) => e,
        Ok(Err(None)) | Err(_) => InstanceError::ShutdownTimeout(options.shutdown_timeout),
    };
    if !options.force_shutdown {
        return Err(error);
    }

    warn!(%target, "{error}, killing instance");
    controller.kill(target).await.map_err(InstanceError::Kill)?;
    wait_for_state(controller, target, false, options.shutdown_timeout, options)
        .await
        .map_err(|e| e.unwrap_or(InstanceError::KillTimeout(options.shutdown_timeout)))
}

/// Polls until the instance reaches the wanted state.
///
/// Returns `Err(None)` when `timeout` elapses and `Err(Some(_))` when the
/// status itself cannot be determined.
async fn wait_for_state(
    controller: &dyn InstanceController,
    target: &InstanceTarget,
    want_running: bool,
    timeout: Duration,
    options: &RestartOptions,
) -> Result<(), Option<InstanceError>> {
    Retry::default()
        .initial_backoff(options.poll_interval)
        .clamp_backoff(options.poll_interval)
        .max_duration(timeout)
        .retry_async(|_| async move {
            match controller.is_running(target).await {
                Ok(running) if running == want_running => RetryResult::Ok(()),
                Ok(_) => RetryResult::RetryableErr(None),
                Err(e) => RetryResult::FatalErr(Some(InstanceError::Status(e))),
            }
        })
        .await
}
