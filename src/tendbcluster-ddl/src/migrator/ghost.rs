// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Migrations driven by a gh-ost subprocess.
//!
//! Each task runs its own gh-ost process and owns its control socket. The
//! process output drives the task's [`MigrationState`]. On SIGHUP a task
//! reads its overrides file, if any, and forwards the new throttling values
//! over the socket. On cancellation the task sends `panic` over the socket
//! and waits for the process to exit.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::migrator::{MigrationOverrides, MigrationState, MigrationTask, ShardMigrator};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
const TAIL_LINES: usize = 20;

/// Runs migrations with the gh-ost binary named in the task's config.
#[derive(Debug, Clone, Default)]
pub struct GhostMigrator;

#[async_trait]
impl ShardMigrator for GhostMigrator {
    async fn migrate(
        &self,
        task: MigrationTask,
        cancel: CancellationToken,
    ) -> Result<MigrationState, anyhow::Error> {
        let name = task.name();
        let binary = &task.config().ghost_binary;
        info!(task = %name, instance = %task.instance, "starting gh-ost");
        let mut child = Command::new(binary)
            .args(task.args(false))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", binary.display()))?;
        let mut stdout = BufReader::new(child.stdout.take().context("stdout not captured")?).lines();
        let mut stderr = BufReader::new(child.stderr.take().context("stderr not captured")?).lines();
        let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

        let mut output = Output::new(&name);
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut aborting = false;
        let status = loop {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line? {
                    Some(line) => output.observe(line),
                    None => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line? {
                    Some(line) => output.observe(line),
                    None => stderr_open = false,
                },
                _ = hangup.recv() => reload(&task).await,
                _ = cancel.cancelled(), if !aborting => {
                    aborting = true;
                    warn!(task = %name, "cancelling migration");
                    if let Err(e) = send_socket_command(&task.socket_file, "panic").await {
                        warn!(task = %name, "panic command failed, killing gh-ost: {e:#}");
                        child.start_kill().context("killing gh-ost")?;
                    }
                }
                status = child.wait() => break status.context("waiting for gh-ost")?,
            }
        };
        while stdout_open {
            match stdout.next_line().await? {
                Some(line) => output.observe(line),
                None => stdout_open = false,
            }
        }
        while stderr_open {
            match stderr.next_line().await? {
                Some(line) => output.observe(line),
                None => stderr_open = false,
            }
        }

        if aborting {
            bail!("migration aborted on cancellation in state {}", output.state);
        }
        if !status.success() {
            bail!(
                "gh-ost {status} in state {}: {}",
                output.state,
                output.tail.iter().map(String::as_str).collect::<Vec<_>>().join(" | ")
            );
        }
        if output.state != MigrationState::CutoverDone {
            bail!(
                "gh-ost exited cleanly in state {} without reporting cut-over: {}",
                output.state,
                output.tail.iter().map(String::as_str).collect::<Vec<_>>().join(" | ")
            );
        }
        info!(task = %name, "migration complete");
        Ok(MigrationState::CutoverDone)
    }
}

struct Output<'a> {
    task: &'a str,
    state: MigrationState,
    tail: VecDeque<String>,
}

impl<'a> Output<'a> {
    fn new(task: &'a str) -> Output<'a> {
        Output {
            task,
            state: MigrationState::Constructed,
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    fn observe(&mut self, line: String) {
        debug!(task = self.task, "gh-ost: {line}");
        let next = self.state.observe(&line);
        if next != self.state {
            info!(task = self.task, from = %self.state, to = %next, "migration state");
            self.state = next;
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }
}

/// Sends one interactive command over a gh-ost control socket and returns
/// the response.
pub async fn send_socket_command(socket: &Path, command: &str) -> Result<String, anyhow::Error> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        stream.write_all(format!("{command}\n").as_bytes()).await?;
        stream.shutdown().await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok::<_, io::Error>(response)
    };
    tokio::time::timeout(SOCKET_TIMEOUT, exchange)
        .await
        .with_context(|| format!("{} did not answer {command:?}", socket.display()))?
        .with_context(|| format!("sending {command:?} to {}", socket.display()))
}

async fn reload(task: &MigrationTask) {
    let name = task.name();
    let Some(path) = task.reload_file() else {
        debug!(task = %name, "SIGHUP ignored: no reload directory");
        return;
    };
    let overrides = match load_overrides(&path).await {
        Ok(Some(overrides)) => overrides,
        Ok(None) => {
            debug!(task = %name, path = %path.display(), "SIGHUP ignored: no overrides file");
            return;
        }
        Err(e) => {
            warn!(task = %name, "ignoring overrides: {e:#}");
            return;
        }
    };
    for command in overrides.commands() {
        match send_socket_command(&task.socket_file, &command).await {
            Ok(response) => info!(task = %name, %command, response = response.trim(), "applied override"),
            Err(e) => warn!(task = %name, %command, "override failed: {e:#}"),
        }
    }
}

async fn load_overrides(path: &Path) -> Result<Option<MigrationOverrides>, anyhow::Error> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let overrides = serde_json::from_str(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(overrides))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;

    use tokio::net::UnixListener;

    use super::*;
    use crate::migrator::MigrationConfig;
    use crate::topology::{Credentials, Instance, InstanceRole};

    fn fake_ghost(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("gh-ost");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn task(config: MigrationConfig) -> MigrationTask {
        let instance = Instance::new(
            "SPT0",
            "127.0.0.1",
            20000,
            Credentials {
                user: "ddl".into(),
                password: "pw".into(),
            },
            InstanceRole::BackendMaster { shard: 0 },
        );
        MigrationTask::new(1, 1, &instance, "db1", "t1", "ADD c INT", Arc::new(config)).unwrap()
    }

    #[tokio::test]
    async fn test_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig {
            ghost_binary: fake_ghost(
                dir.path(),
                "echo 'Inspector initiated on 127.0.0.1:20000'\necho 'Row copy complete' >&2\necho '# Done migrating `db1_0`.`t1`'",
            ),
            socket_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let state = GhostMigrator
            .migrate(task(config), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state, MigrationState::CutoverDone);
    }

    #[tokio::test]
    async fn test_failed_run_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig {
            ghost_binary: fake_ghost(dir.path(), "echo 'FATAL table has no unique key' >&2\nexit 3"),
            socket_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = GhostMigrator
            .migrate(task(config), CancellationToken::new())
            .await
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("exit status: 3"), "{msg}");
        assert!(msg.contains("no unique key"), "{msg}");
    }

    #[tokio::test]
    async fn test_clean_exit_before_cutover_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig {
            ghost_binary: fake_ghost(
                dir.path(),
                "echo 'Inspector initiated on 127.0.0.1:20000'\necho 'Copy: 0/100 0.0%'\nexit 0",
            ),
            socket_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = GhostMigrator
            .migrate(task(config), CancellationToken::new())
            .await
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("in state RowCopying"), "{msg}");
        assert!(msg.contains("without reporting cut-over"), "{msg}");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig {
            ghost_binary: dir.path().join("nope"),
            ..Default::default()
        };
        let err = GhostMigrator
            .migrate(task(config), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("spawning"));
    }

    #[tokio::test]
    async fn test_socket_command() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ghost.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = String::new();
            stream.read_to_string(&mut request).await.unwrap();
            stream.write_all(b"ok\n").await.unwrap();
            request
        });
        let response = send_socket_command(&socket, "chunk-size=500").await.unwrap();
        assert_eq!(response, "ok\n");
        assert_eq!(server.await.unwrap(), "chunk-size=500\n");

        let missing = dir.path().join("missing.sock");
        assert!(send_socket_command(&missing, "status").await.is_err());
    }

    #[tokio::test]
    async fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.1.0.db1_0.t1.json");
        assert_eq!(load_overrides(&path).await.unwrap(), None);

        std::fs::write(&path, r#"{"chunk-size": 200, "max-load": "Threads_running=30"}"#).unwrap();
        let overrides = load_overrides(&path).await.unwrap().unwrap();
        assert_eq!(
            overrides.commands(),
            vec!["chunk-size=200", "max-load=Threads_running=30"]
        );

        std::fs::write(&path, r#"{"chunk_size": 200}"#).unwrap();
        assert!(load_overrides(&path).await.is_err());
    }
}
