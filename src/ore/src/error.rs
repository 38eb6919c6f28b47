// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Error utilities.

use std::error::Error;
use std::fmt::{self, Display};

/// Extension methods for [`std::error::Error`].
pub trait ErrorExt: Error {
    /// Returns a type that displays the error, along with the chain of
    /// _source_ errors or causes, if there are any.
    fn display_with_causes(&self) -> ErrorChainFormatter<&Self> {
        ErrorChainFormatter(self)
    }

    /// Converts `self` to a string `String`, along with the chain of _source_
    /// errors or causes, if there are any.
    fn to_string_with_causes(&self) -> String {
        format!("{}", self.display_with_causes())
    }
}

impl<E: Error + ?Sized> ErrorExt for E {}

/// Formats an error with its chain of causes.
///
/// See [`ErrorExt::display_with_causes`].
#[derive(Debug)]
pub struct ErrorChainFormatter<E>(E);

impl<E: Error> Display for ErrorChainFormatter<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)?;
        let mut maybe_cause = self.0.source();
        while let Some(cause) = maybe_cause {
            write!(f, ": {}", cause)?;
            maybe_cause = cause.source();
        }
        Ok(())
    }
}
