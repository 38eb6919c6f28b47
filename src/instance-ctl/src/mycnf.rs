// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Discovery of per-instance runtime files from a `my.cnf` defaults file.
//!
//! Instances sharing a host never share a socket or a pid file, so the
//! restart driver always reads both from the instance's own defaults file
//! rather than assuming a convention.

use std::path::{Path, PathBuf};
use std::{fmt, io};

/// The `[mysqld]` settings the restart driver cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqldDefaults {
    pub socket: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub datadir: Option<PathBuf>,
    pub port: Option<u16>,
}

impl MysqldDefaults {
    /// Reads and parses the defaults file at `path`.
    pub fn read(path: &Path) -> Result<MysqldDefaults, Error> {
        let contents = std::fs::read_to_string(path)?;
        MysqldDefaults::parse(&contents).map_err(|e| match e {
            Error::MissingSocket(_) => Error::MissingSocket(path.display().to_string()),
            e => e,
        })
    }

    /// Parses the `[mysqld]` section of a defaults file.
    ///
    /// Option names are normalized the way the server does it, so `pid-file`
    /// and `pid_file` are the same option. A relative `pid-file` is resolved
    /// against `datadir`.
    pub fn parse(contents: &str) -> Result<MysqldDefaults, Error> {
        let mut in_mysqld = false;
        let mut socket = None;
        let mut pid_file = None;
        let mut datadir = None;
        let mut port = None;
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[') {
                let section = section.trim_end_matches(']').trim();
                in_mysqld = section == "mysqld";
                continue;
            }
            if !in_mysqld {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                // Bare flags such as `skip-name-resolve`.
                continue;
            };
            let key = key.trim().replace('-', "_");
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            match key.as_str() {
                "socket" => socket = Some(PathBuf::from(value)),
                "pid_file" => pid_file = Some(PathBuf::from(value)),
                "datadir" => datadir = Some(PathBuf::from(value)),
                "port" => {
                    port = Some(value.parse().map_err(|_| Error::InvalidValue {
                        line: lineno + 1,
                        key: "port".into(),
                        value: value.into(),
                    })?)
                }
                _ => {}
            }
        }
        let socket = socket.ok_or_else(|| Error::MissingSocket("<defaults>".into()))?;
        let pid_file = match (pid_file, &datadir) {
            (Some(pid_file), Some(datadir)) if pid_file.is_relative() => Some(datadir.join(pid_file)),
            (pid_file, _) => pid_file,
        };
        Ok(MysqldDefaults {
            socket,
            pid_file,
            datadir,
            port,
        })
    }
}

/// A defaults file-related error.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(io::Error),
    /// The `[mysqld]` section does not name a socket.
    MissingSocket(String),
    /// An option had a value that could not be parsed.
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "unable to read defaults file: {}", e),
            Error::MissingSocket(path) => write!(f, "no [mysqld] socket configured in {}", path),
            Error::InvalidValue { line, key, value } => {
                write!(f, "line {}: invalid value for {}: {:?}", line, key, value)
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::{Error, MysqldDefaults};

    const MY_CNF: &str = r#"
[client]
socket = /tmp/client.sock

[mysqld]
# data lives on the big disk
datadir = /data1/mysqldata/20000/data
pid-file = mysql.pid
socket = "/data1/mysqldata/20000/mysql.sock"
port=20000
skip-name-resolve

[mysqldump]
quick
"#;

    #[test]
    fn test_parse_mysqld_section() {
        let defaults = MysqldDefaults::parse(MY_CNF).unwrap();
        assert_eq!(
            defaults,
            MysqldDefaults {
                socket: PathBuf::from("/data1/mysqldata/20000/mysql.sock"),
                pid_file: Some(PathBuf::from("/data1/mysqldata/20000/data/mysql.pid")),
                datadir: Some(PathBuf::from("/data1/mysqldata/20000/data")),
                port: Some(20000),
            }
        );
    }

    #[test]
    fn test_missing_socket() {
        let err = MysqldDefaults::parse("[client]\nsocket=/tmp/x.sock\n").unwrap_err();
        assert!(matches!(err, Error::MissingSocket(_)), "{err}");
    }

    #[test]
    fn test_invalid_port() {
        let err = MysqldDefaults::parse("[mysqld]\nsocket=/tmp/x.sock\nport=abc\n").unwrap_err();
        assert_eq!(err.to_string(), "line 3: invalid value for port: \"abc\"");
    }

    #[test]
    fn test_read_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[mysqld]\ndatadir=/data\n").unwrap();
        let err = MysqldDefaults::read(file.path()).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("no [mysqld] socket configured in {}", file.path().display())
        );
    }
}
