// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use mysql_async::{Conn, Opts, OptsBuilder};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::MySqlError;

pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub connect_timeout: Option<Duration>,
    pub tcp_keepalive: Option<Duration>,
    // There are other timeout options on `mysql_async::OptsBuilder`
    // (e.g. `conn_ttl` and `wait_timeout`) that could be exposed
    // but they only apply to connection pools, which we are not using.
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            tcp_keepalive: Some(DEFAULT_TCP_KEEPALIVE),
        }
    }
}

impl TimeoutConfig {
    pub fn build(connect_timeout: Duration, tcp_keepalive: Duration) -> Self {
        // Out of range values are logged and replaced with the default rather
        // than rejected, so that a bad knob never blocks an executor run.
        let connect_timeout = if connect_timeout.is_zero() {
            error!("connect_timeout must be positive, using the default");
            Some(DEFAULT_CONNECT_TIMEOUT)
        } else {
            Some(connect_timeout)
        };

        let tcp_keepalive = match u32::try_from(tcp_keepalive.as_millis()) {
            Err(_) => {
                error!(
                    "tcp_keepalive is too large: {}. Maximum is {}.",
                    tcp_keepalive.as_millis(),
                    u32::MAX,
                );
                Some(DEFAULT_TCP_KEEPALIVE)
            }
            Ok(_) => Some(tcp_keepalive),
        };

        Self {
            connect_timeout,
            tcp_keepalive,
        }
    }

    /// Apply relevant timeout configurations to a `mysql_async::OptsBuilder`.
    pub fn apply_to_opts(&self, mut opts_builder: OptsBuilder) -> Result<OptsBuilder, MySqlError> {
        if let Some(tcp_keepalive) = self.tcp_keepalive {
            opts_builder = opts_builder.tcp_keepalive(Some(
                u32::try_from(tcp_keepalive.as_millis()).map_err(|e| {
                    MySqlError::InvalidClientConfig(format!(
                        "invalid tcp_keepalive duration: {}",
                        e
                    ))
                })?,
            ));
        }
        Ok(opts_builder)
    }
}

/// A MySQL connection.
///
/// This wrapper is used in place of `mysql_async::Conn` so that every
/// connection the executors open goes through [`Config::connect`] and is
/// logged on the way in and out.
#[derive(Debug)]
pub struct MySqlConn {
    conn: Conn,
    address: String,
}

impl Deref for MySqlConn {
    type Target = Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for MySqlConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl MySqlConn {
    pub async fn disconnect(self) -> Result<(), MySqlError> {
        let address = self.address;
        self.conn.disconnect().await?;
        info!(%address, "disconnected");
        Ok(())
    }

    /// The `host:port` this connection was opened against.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Configuration for MySQL connections.
///
/// This wraps [`mysql_async::Opts`] together with the client-side timeouts
/// applied when connecting.
#[derive(Clone, Debug)]
pub struct Config {
    inner: Opts,
    timeouts: TimeoutConfig,
}

impl Config {
    pub fn new(inner: Opts, timeouts: TimeoutConfig) -> Self {
        Self { inner, timeouts }
    }

    /// Builds a TCP configuration for `user@host:port` with no default
    /// database selected.
    pub fn tcp(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeouts: TimeoutConfig,
    ) -> Result<Self, MySqlError> {
        let opts_builder = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(user))
            .pass(Some(password))
            .prefer_socket(false);
        let opts_builder = timeouts.apply_to_opts(opts_builder)?;
        Ok(Self::new(Opts::from(opts_builder), timeouts))
    }

    fn address(&self) -> String {
        format!("{}:{}", self.inner.ip_or_hostname(), self.inner.tcp_port())
    }

    pub async fn connect(&self, task_name: &str) -> Result<MySqlConn, MySqlError> {
        let address = self.address();
        let user = self.inner.user().unwrap_or("<unknown-user>");
        info!(%task_name, %address, %user, "connecting");
        match self.connect_internal().await {
            Ok(conn) => {
                info!(%task_name, %address, "connected");
                Ok(MySqlConn { conn, address })
            }
            Err(e) => {
                warn!(%task_name, %address, "connection failed: {e:#}");
                Err(e)
            }
        }
    }

    async fn connect_internal(&self) -> Result<Conn, MySqlError> {
        let connect = Conn::new(self.inner.clone());
        match self.timeouts.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, connect).await {
                Ok(res) => Ok(res?),
                Err(_) => Err(MySqlError::ConnectionTimeout(timeout)),
            },
            None => Ok(connect.await?),
        }
    }
}
