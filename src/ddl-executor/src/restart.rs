// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `restart` subcommand.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use dbm_instance_ctl::mysqld::MysqldController;
use dbm_instance_ctl::{InstanceTarget, RestartOptions, restart_in_place};
use tracing::info;

#[derive(clap::Args, Debug)]
pub struct RestartArgs {
    /// Ports of the instances to restart, in order.
    #[clap(long, env = "DBM_DDL_RESTART_PORTS", value_name = "PORT", value_delimiter = ',', required = true)]
    pub port: Vec<u16>,
    /// Location of each instance's defaults file. `{port}` is replaced by the
    /// instance's port.
    #[clap(long, env = "DBM_DDL_DEFAULTS_FILE", value_name = "PATH", default_value = "/etc/my.cnf.{port}")]
    pub defaults_file_template: String,

    /// Kill an instance whose graceful shutdown fails or times out.
    #[clap(long, env = "DBM_DDL_FORCE_SHUTDOWN")]
    pub force_shutdown: bool,
    /// Fail an instance that is already stopped instead of starting it.
    #[clap(long, env = "DBM_DDL_ABORT_WHEN_STOPPED")]
    pub abort_when_stopped: bool,
    /// Keep restarting the remaining instances after one fails.
    #[clap(long, env = "DBM_DDL_CONTINUE_ON_ERROR")]
    pub continue_on_other_instance_error: bool,
    #[clap(long, value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "60s")]
    pub shutdown_timeout: Duration,
    #[clap(long, value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5m")]
    pub start_timeout: Duration,
    #[clap(long, value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "1s")]
    pub poll_interval: Duration,

    #[clap(long, env = "DBM_DDL_MYSQLADMIN", value_name = "PATH", default_value = "mysqladmin")]
    pub mysqladmin: PathBuf,
    #[clap(long, env = "DBM_DDL_MYSQLD_SAFE", value_name = "PATH", default_value = "mysqld_safe")]
    pub mysqld_safe: PathBuf,
    /// The OS user the servers run as.
    #[clap(long, env = "DBM_DDL_OS_USER", value_name = "USER", default_value = "mysql")]
    pub os_user: String,
    /// Account used for graceful shutdown.
    #[clap(long, env = "DBM_DDL_ADMIN_USER", value_name = "USER", default_value = "root")]
    pub admin_user: String,
    #[clap(long, env = "DBM_DDL_ADMIN_PASSWORD", value_name = "PASSWORD", hide_env_values = true)]
    pub admin_password: String,
}

impl RestartArgs {
    pub fn defaults_file(&self, port: u16) -> PathBuf {
        PathBuf::from(
            self.defaults_file_template
                .replace("{port}", &port.to_string()),
        )
    }

    pub fn options(&self) -> RestartOptions {
        RestartOptions {
            force_shutdown: self.force_shutdown,
            abort_when_stopped: self.abort_when_stopped,
            continue_on_other_instance_error: self.continue_on_other_instance_error,
            shutdown_timeout: self.shutdown_timeout,
            start_timeout: self.start_timeout,
            poll_interval: self.poll_interval,
        }
    }

    fn controller(&self) -> MysqldController {
        MysqldController {
            mysqladmin: self.mysqladmin.clone(),
            mysqld_safe: self.mysqld_safe.clone(),
            os_user: self.os_user.clone(),
            admin_user: self.admin_user.clone(),
            admin_password: self.admin_password.clone(),
        }
    }
}

pub async fn run(args: RestartArgs) -> Result<(), anyhow::Error> {
    let targets = args
        .port
        .iter()
        .map(|port| {
            let path = args.defaults_file(*port);
            InstanceTarget::from_defaults_file(*port, &path)
                .with_context(|| format!("reading {}", path.display()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    restart_in_place(&args.controller(), &targets, &args.options()).await?;
    info!(instances = targets.len(), "restart complete");
    Ok(())
}
