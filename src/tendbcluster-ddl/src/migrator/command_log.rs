// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::DdlError;
use crate::migrator::MigrationTask;

/// Append-only record of every engine invocation of a batch, one line per
/// task: `host:port`, database, table and the shell command, tab separated.
#[derive(Debug)]
pub struct CommandLog {
    path: PathBuf,
    file: File,
    lines: usize,
}

impl CommandLog {
    /// Opens `path` for appending, creating it and its parent directory.
    pub async fn create(path: &Path) -> Result<CommandLog, DdlError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DdlError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| DdlError::io(path, e))?;
        Ok(CommandLog {
            path: path.to_path_buf(),
            file,
            lines: 0,
        })
    }

    /// Appends the line for `task` and flushes it to the file.
    pub async fn record(&mut self, task: &MigrationTask) -> Result<(), DdlError> {
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            task.instance.address(),
            task.database,
            task.table,
            task.command_line()
        );
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DdlError::io(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| DdlError::io(&self.path, e))?;
        self.lines += 1;
        Ok(())
    }

    /// Lines appended through this handle.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// The log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
