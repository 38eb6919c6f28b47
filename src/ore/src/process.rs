// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Utilities for process-handling

use std::env;

use itertools::Itertools;
use shell_words::quote as escape;

/// Returns a human-readable version of how the current process was invoked.
///
/// Only env vars that start with `env_prefix` are included. Values of env
/// vars whose name contains `PASSWORD` are redacted, as are the values of
/// long flags whose name contains `password`.
pub fn invocation(env_prefix: &str) -> String {
    env::vars_os()
        .map(|(name, value)| {
            (
                name.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .filter(|(name, _value)| name.starts_with(env_prefix))
        .map(|(name, value)| {
            let value = if name.contains("PASSWORD") {
                REDACTED.to_string()
            } else {
                value
            };
            format!("{}={}", escape(&name), escape(&value))
        })
        .chain(
            redact_args(env::args_os().map(|arg| arg.to_string_lossy().into_owned()))
                .map(|arg| escape(&arg).into_owned()),
        )
        .join(" ")
}

/// Replaces the value of every `--*password*` flag, in both the
/// `--flag value` and `--flag=value` forms.
fn redact_args(args: impl Iterator<Item = String>) -> impl Iterator<Item = String> {
    let mut redact_next = false;
    args.map(move |arg| {
        if std::mem::take(&mut redact_next) {
            return REDACTED.to_string();
        }
        let Some(flag) = arg.strip_prefix("--") else {
            return arg;
        };
        match flag.split_once('=') {
            Some((name, _)) if is_password_flag(name) => format!("--{name}={REDACTED}"),
            Some(_) => arg,
            None => {
                redact_next = is_password_flag(flag);
                arg
            }
        }
    })
}

fn is_password_flag(name: &str) -> bool {
    name.to_ascii_lowercase().contains("password")
}

/// The marker substituted for secrets in rendered command lines.
pub const REDACTED: &str = "<redacted>";

/// Renders `program` and `args` as a single line that a POSIX shell would
/// split back into the same words.
pub fn command_line<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    std::iter::once(escape(program).into_owned())
        .chain(args.into_iter().map(|arg| escape(arg.as_ref()).into_owned()))
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::{REDACTED, command_line, redact_args};

    #[test]
    fn test_redact_args() {
        let args = [
            "dbm-ddl-executor",
            "online-ddl",
            "--user",
            "admin",
            "--password",
            "hunter2",
            "--admin-password=s3cret",
            "--batch=batch.json",
            "--password-file",
            "/etc/pw",
            "--password",
        ];
        let redacted: Vec<_> = redact_args(args.iter().map(|a| a.to_string())).collect();
        assert_eq!(
            redacted,
            vec![
                "dbm-ddl-executor",
                "online-ddl",
                "--user",
                "admin",
                "--password",
                REDACTED,
                "--admin-password=<redacted>",
                "--batch=batch.json",
                "--password-file",
                REDACTED,
                "--password",
            ]
        );
        assert!(!redacted.iter().any(|a| a.contains("hunter2") || a.contains("s3cret")));
    }

    #[test]
    fn test_command_line_round_trips_through_shell_words() {
        let args = [
            "--alter=ADD COLUMN c1 INT",
            "--database=db1_0",
            "--max-load=Threads_running=25",
            "it's",
        ];
        let line = command_line("gh-ost", args);
        assert!(line.starts_with("gh-ost "), "{line}");
        let words = shell_words::split(&line).unwrap();
        assert_eq!(words[0], "gh-ost");
        assert_eq!(&words[1..], &args);
    }
}
