// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Named task spawning.
//!
//! Every task spawned through this module runs inside a `tracing` span that
//! carries the task's name, so log lines emitted by concurrently running
//! workers can be told apart.

use std::future::Future;

use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

/// Spawns a new asynchronous task with a name.
///
/// The name is produced lazily by `nc` so that callers can build it with
/// `format!` without paying for it when tracing is disabled.
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = nc();
    let span = tracing::info_span!("task", name = name.as_ref());
    tokio::spawn(future.instrument(span))
}

/// Extension methods for [`JoinSet`].
pub trait JoinSetExt<T> {
    /// Spawns a named task onto the set. See [`spawn`].
    fn spawn_named<Fut, Name, NameClosure>(&mut self, nc: NameClosure, future: Fut)
    where
        Name: AsRef<str>,
        NameClosure: FnOnce() -> Name,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

impl<T> JoinSetExt<T> for JoinSet<T> {
    fn spawn_named<Fut, Name, NameClosure>(&mut self, nc: NameClosure, future: Fut)
    where
        Name: AsRef<str>,
        NameClosure: FnOnce() -> Name,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = nc();
        let span = tracing::info_span!("task", name = name.as_ref());
        self.spawn(future.instrument(span));
    }
}
