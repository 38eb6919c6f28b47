// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Online DDL executor for TenDB clusters.
//!
//! A TenDB cluster is a central coordinator (`TDBCTL`), a set of frontend
//! routers (`SPIDER`, `SPIDER_SLAVE`, plus operator-only maintenance routers)
//! and N backend master shards. Applying a schema change while the cluster
//! serves traffic means touching all three tiers in an order that never lets
//! a client see an object that is missing underneath it:
//!
//!  * additive `ALTER`s run on the backend shards first, then on the routers,
//!    then on the coordinator;
//!  * destructive `ALTER`s (dropping a column or an index) run on the routers
//!    first, then on the shards, then on the coordinator;
//!  * every other statement runs on the coordinator, which dispatches it.
//!
//! Shards are migrated with gh-ost, in parallel, one task per shard. Before
//! anything executes, a [precheck](precheck) proves that no long running
//! session or metadata lock on any instance would block the change.
//!
//! The entry point is [`Orchestrator::run`].

pub mod applier;
pub mod batch;
pub mod error;
pub mod matcher;
pub mod migrator;
pub mod orchestrator;
pub mod parser;
pub mod precheck;
pub mod session;
pub mod topology;

pub use crate::error::DdlError;
pub use crate::orchestrator::{BatchReport, Orchestrator, OrchestratorConfig};
