// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Command-line parsing utilities.

use std::fmt::Display;
use std::str::FromStr;

use clap::{FromArgMatches, Parser};

/// A help template for use with clap that does not include the name of the
/// binary or the version in the help output.
const NO_VERSION_HELP_TEMPLATE: &str = "{about}

USAGE:
    {usage}

{all-args}";

/// Parses command-line arguments according to a clap `Parser` after
/// applying our customizations.
pub fn parse_args<O>() -> O
where
    O: Parser,
{
    let matches = command::<O>().get_matches();
    O::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
}

fn command<O>() -> clap::Command
where
    O: Parser,
{
    O::command()
        .args_override_self(true)
        .disable_version_flag(true)
        .help_template(NO_VERSION_HELP_TEMPLATE)
}

/// A command-line argument of the form `KEY=VALUE`.
#[derive(Debug, Clone)]
pub struct KeyValueArg<K, V> {
    /// The key of the command-line argument.
    pub key: K,
    /// The value of the command-line argument.
    pub value: V,
}

impl<K, V> FromStr for KeyValueArg<K, V>
where
    K: FromStr,
    K::Err: Display,
    V: FromStr,
    V::Err: Display,
{
    type Err = String;

    fn from_str(s: &str) -> Result<KeyValueArg<K, V>, String> {
        let mut parts = s.splitn(2, '=');
        let key = parts.next().expect("always one part");
        let value = parts
            .next()
            .ok_or_else(|| "must have format KEY=VALUE".to_string())?;
        Ok(KeyValueArg {
            key: key.parse().map_err(|e| format!("parsing key: {}", e))?,
            value: value.parse().map_err(|e| format!("parsing value: {}", e))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{KeyValueArg, command};

    #[derive(Parser, Debug)]
    #[clap(name = "tool", version = "1.0", about = "Does things.")]
    struct Args {
        #[clap(long)]
        level: Option<u8>,
    }

    #[test]
    fn test_command_customizations() {
        let err = command::<Args>()
            .try_get_matches_from(["tool", "--version"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);

        // Repeated flags override instead of erroring.
        let matches = command::<Args>()
            .try_get_matches_from(["tool", "--level", "1", "--level", "2"])
            .unwrap();
        assert_eq!(matches.get_one::<u8>("level"), Some(&2));

        let help = command::<Args>().render_help().to_string();
        assert!(help.starts_with("Does things."), "{help}");
        assert!(!help.contains("1.0"), "{help}");
    }

    #[test]
    fn test_key_value_arg() {
        let arg: KeyValueArg<String, String> = "chunk-size=500".parse().unwrap();
        assert_eq!(arg.key, "chunk-size");
        assert_eq!(arg.value, "500");

        // Only the first `=` separates the key from the value.
        let arg: KeyValueArg<String, String> = "max-load=Threads_running=25".parse().unwrap();
        assert_eq!(arg.key, "max-load");
        assert_eq!(arg.value, "Threads_running=25");

        let err = "chunk-size".parse::<KeyValueArg<String, String>>().unwrap_err();
        assert_eq!(err, "must have format KEY=VALUE");

        let err = "chunk-size=abc"
            .parse::<KeyValueArg<String, u64>>()
            .unwrap_err();
        assert!(err.starts_with("parsing value:"), "{err}");
    }
}
