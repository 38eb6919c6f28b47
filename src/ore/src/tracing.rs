// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracing utilities.
//!
//! This module contains application tracing utilities built on top of the
//! [`tracing`] library. The key export is the **[`configure`]** function,
//! which configures the `tracing` crate with sensible defaults and should be
//! called during initialization of every binary.

use std::io::{self, IsTerminal};

use tracing::{Event, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{format, Writer};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Application tracing configuration.
///
/// See the [`configure`] function for details.
#[derive(Debug)]
pub struct TracingConfig {
    /// Configuration of the stderr log.
    pub stderr_log: StderrLogConfig,
}

/// Configures the stderr log.
#[derive(Debug)]
pub struct StderrLogConfig {
    /// An optional prefix for each stderr log line.
    pub prefix: Option<String>,
    /// A filter which determines which events are emitted to the log.
    pub filter: EnvFilter,
}

impl StderrLogConfig {
    /// Builds a stderr log configuration from a filter directive string such
    /// as `info,dbm_tendbcluster_ddl=debug`.
    pub fn from_directives(
        prefix: Option<String>,
        directives: &str,
    ) -> Result<StderrLogConfig, anyhow::Error> {
        Ok(StderrLogConfig {
            prefix,
            filter: EnvFilter::try_new(directives)?,
        })
    }
}

/// Enables application tracing via the [`tracing`] library.
///
/// The `tracing` library is configured to emit events as textual log lines to
/// stderr. [`StderrLogConfig`] offers a small degree of control over this
/// behavior.
pub fn configure(service_name: &str, config: TracingConfig) -> Result<(), anyhow::Error> {
    let stderr_log_layer = fmt::layer()
        .event_format(PrefixFormat {
            inner: format(),
            prefix: config.stderr_log.prefix,
        })
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_filter(config.stderr_log.filter);

    tracing_subscriber::registry()
        .with(stderr_log_layer)
        .try_init()?;

    tracing::debug!(%service_name, "tracing configured");
    Ok(())
}

/// A wrapper around a [`FormatEvent`] that adds an optional prefix to each
/// event.
#[derive(Debug)]
pub struct PrefixFormat<F> {
    inner: F,
    prefix: Option<String>,
}

impl<F, C, N> FormatEvent<C, N> for PrefixFormat<F>
where
    C: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<C, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, C, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(writer, "{}: ", prefix)?;
        }
        self.inner.format_event(ctx, writer, event)
    }
}

#[cfg(test)]
mod tests {
    use super::StderrLogConfig;

    #[test]
    fn test_filter_directives() {
        assert!(StderrLogConfig::from_directives(None, "info,dbm_tendbcluster_ddl=debug").is_ok());
        assert!(StderrLogConfig::from_directives(None, "dbm_tendbcluster_ddl=verbose").is_err());
    }
}
