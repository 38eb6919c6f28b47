// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster layout as seen from the coordinator.
//!
//! The coordinator's `mysql.servers` catalogue names every router and every
//! backend shard. [`resolve`] reads it, classifies each row, and probes every
//! element it intends to touch: a batch never starts against a layout it has
//! not seen answer.

use std::collections::BTreeSet;
use std::fmt;

use dbm_mysql_util::MySqlError;
use derivative::Derivative;
use tracing::{debug, info};

use crate::error::DdlError;
use crate::session::{Connector, close};

/// Substring of `SELECT VERSION()` identifying routers that forward DDL to
/// the coordinator unless told otherwise.
pub const NEWER_ROUTER_FAMILY: &str = "tspider-4";

/// Login credentials for an instance.
#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug)]
pub struct Credentials {
    /// The user name.
    pub user: String,
    /// The password.
    #[derivative(Debug = "ignore")]
    pub password: String,
}

/// What an instance does in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceRole {
    /// The central controller (`TDBCTL`).
    Coordinator,
    /// The master of backend shard `shard`.
    BackendMaster {
        /// The shard number, parsed from the `SPT<n>` server name.
        shard: u32,
    },
    /// A read-write router (`SPIDER`).
    RouterMaster,
    /// A read-only router (`SPIDER_SLAVE`).
    RouterSlave,
    /// An operator-only router supplied outside the catalogue.
    RouterMaintenance,
}

impl InstanceRole {
    /// Reports whether the role is one of the router roles.
    pub fn is_router(&self) -> bool {
        matches!(
            self,
            InstanceRole::RouterMaster | InstanceRole::RouterSlave | InstanceRole::RouterMaintenance
        )
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Coordinator => f.write_str("coordinator"),
            InstanceRole::BackendMaster { shard } => write!(f, "backend shard {shard}"),
            InstanceRole::RouterMaster => f.write_str("master router"),
            InstanceRole::RouterSlave => f.write_str("slave router"),
            InstanceRole::RouterMaintenance => f.write_str("maintenance router"),
        }
    }
}

/// A reachable element of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// The catalogue name, e.g. `SPT3` or `SPIDER_SLAVE0`.
    pub name: String,
    /// The host.
    pub host: String,
    /// The port.
    pub port: u16,
    /// How to log in.
    pub credentials: Credentials,
    /// What the instance does.
    pub role: InstanceRole,
    /// The server version string, once probed.
    pub version: Option<String>,
}

impl Instance {
    /// Creates an instance whose version is not yet known.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        credentials: Credentials,
        role: InstanceRole,
    ) -> Instance {
        Instance {
            name: name.into(),
            host: host.into(),
            port,
            credentials,
            role,
            version: None,
        }
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the shard number of a backend master.
    pub fn shard(&self) -> Option<u32> {
        match self.role {
            InstanceRole::BackendMaster { shard } => Some(shard),
            _ => None,
        }
    }

    /// Reports whether sessions on this router must switch off DDL
    /// forwarding before running a statement locally.
    pub fn disables_ddl_forwarding(&self) -> bool {
        self.role.is_router()
            && self
                .version
                .as_deref()
                .is_some_and(|v| v.contains(NEWER_ROUTER_FAMILY))
    }

    fn endpoint(&self) -> (InstanceRole, &str, u16) {
        (self.role, &self.host, self.port)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.name, self.host, self.port)
    }
}

/// One row of the coordinator's `mysql.servers` catalogue.
#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug)]
pub struct ServerRecord {
    /// `Server_name`.
    pub server_name: String,
    /// `Host`.
    pub host: String,
    /// `Port`.
    pub port: u16,
    /// `Username`.
    pub username: String,
    /// `Password`.
    #[derivative(Debug = "ignore")]
    pub password: String,
    /// `Wrapper`, which carries the role.
    pub wrapper: String,
}

impl ServerRecord {
    /// Classifies the row. Rows the executor never touches, such as
    /// coordinator peers and backend replicas, yield `None`.
    pub fn role(&self) -> Result<Option<InstanceRole>, DdlError> {
        match self.wrapper.to_ascii_uppercase().as_str() {
            "MYSQL" => {
                let shard = self
                    .server_name
                    .strip_prefix("SPT")
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| {
                        DdlError::TopologyUnavailable(format!(
                            "backend server name {:?} does not carry a shard number",
                            self.server_name
                        ))
                    })?;
                Ok(Some(InstanceRole::BackendMaster { shard }))
            }
            "SPIDER" => Ok(Some(InstanceRole::RouterMaster)),
            "SPIDER_SLAVE" => Ok(Some(InstanceRole::RouterSlave)),
            "MYSQL_SLAVE" | "TDBCTL" => Ok(None),
            other => Err(DdlError::TopologyUnavailable(format!(
                "unknown wrapper {other:?} for server {}",
                self.server_name
            ))),
        }
    }

    fn into_instance(self, role: InstanceRole) -> Instance {
        Instance::new(
            self.server_name,
            self.host,
            self.port,
            Credentials {
                user: self.username,
                password: self.password,
            },
            role,
        )
    }
}

type Endpoint = (InstanceRole, String, u16);

/// The elements a batch touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    coordinator: Instance,
    backends: Vec<Instance>,
    routers: Vec<Instance>,
}

impl Topology {
    /// Builds a topology from catalogue rows without contacting anything.
    ///
    /// Backends are ordered by shard number. Routers are ordered master
    /// routers first, then slave routers, each in catalogue order, then the
    /// maintenance routers as given.
    pub fn from_catalogue(
        coordinator: Instance,
        records: &[ServerRecord],
        maintenance: &[Instance],
    ) -> Result<Topology, DdlError> {
        let mut backends = Vec::new();
        let mut masters = Vec::new();
        let mut slaves = Vec::new();
        for record in records {
            match record.role()? {
                Some(role @ InstanceRole::BackendMaster { .. }) => {
                    backends.push(record.clone().into_instance(role))
                }
                Some(InstanceRole::RouterMaster) => {
                    masters.push(record.clone().into_instance(InstanceRole::RouterMaster))
                }
                Some(InstanceRole::RouterSlave) => {
                    slaves.push(record.clone().into_instance(InstanceRole::RouterSlave))
                }
                _ => {}
            }
        }
        backends.sort_by_key(|b| b.shard());
        let mut seen = BTreeSet::new();
        for backend in &backends {
            if !seen.insert(backend.shard()) {
                return Err(DdlError::TopologyUnavailable(format!(
                    "catalogue lists {} more than once",
                    backend.name
                )));
            }
        }
        if backends.is_empty() {
            return Err(DdlError::TopologyUnavailable(
                "catalogue lists no backend shard".into(),
            ));
        }
        let routers = masters
            .into_iter()
            .chain(slaves)
            .chain(maintenance.iter().cloned().map(|mut router| {
                router.role = InstanceRole::RouterMaintenance;
                router
            }))
            .collect();
        Ok(Topology {
            coordinator,
            backends,
            routers,
        })
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &Instance {
        &self.coordinator
    }

    /// The backend shard masters, by shard number.
    pub fn backends(&self) -> &[Instance] {
        &self.backends
    }

    /// Every router, in apply order.
    pub fn routers(&self) -> &[Instance] {
        &self.routers
    }

    /// Checks that a fresh catalogue read still describes this topology.
    ///
    /// Versions and maintenance routers are outside the catalogue and are not
    /// compared.
    pub fn verify_catalogue(&self, records: &[ServerRecord]) -> Result<(), DdlError> {
        let current = Topology::from_catalogue(self.coordinator.clone(), records, &[])
            .map_err(|e| DdlError::TopologyChanged(e.to_string()))?;
        let endpoints = |t: &Topology| -> BTreeSet<Endpoint> {
            t.backends
                .iter()
                .chain(t.routers.iter())
                .filter(|i| i.role != InstanceRole::RouterMaintenance)
                .map(|i| {
                    let (role, host, port) = i.endpoint();
                    (role, host.to_string(), port)
                })
                .collect()
        };
        let before = endpoints(self);
        let after = endpoints(&current);
        if before == after {
            return Ok(());
        }
        let describe = |set: BTreeSet<Endpoint>| {
            set.into_iter()
                .map(|(role, host, port)| format!("{role} {host}:{port}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        Err(DdlError::TopologyChanged(format!(
            "gone: [{}]; new: [{}]",
            describe(before.difference(&after).cloned().collect()),
            describe(after.difference(&before).cloned().collect()),
        )))
    }
}

/// Reads the catalogue on `coordinator` and probes every element of the
/// resulting topology, recording router versions.
pub async fn resolve(
    connector: &dyn Connector,
    coordinator: Instance,
    maintenance: &[Instance],
) -> Result<Topology, DdlError> {
    let records = read_catalogue(connector, &coordinator)
        .await
        .map_err(|e| DdlError::TopologyUnavailable(e.to_string()))?;
    let mut topology = Topology::from_catalogue(coordinator, &records, maintenance)?;

    topology.coordinator.version = Some(probe_version(connector, &topology.coordinator).await?);
    for instance in topology
        .backends
        .iter_mut()
        .chain(topology.routers.iter_mut())
    {
        let version = probe_version(connector, instance).await?;
        debug!(%instance, %version, "probed");
        instance.version = Some(version);
    }
    info!(
        coordinator = %topology.coordinator,
        backends = topology.backends.len(),
        routers = topology.routers.len(),
        "resolved cluster topology"
    );
    Ok(topology)
}

/// Reads the `mysql.servers` catalogue on the coordinator.
pub async fn read_catalogue(
    connector: &dyn Connector,
    coordinator: &Instance,
) -> Result<Vec<ServerRecord>, DdlError> {
    let mut session = connector
        .connect(coordinator, "read-catalogue")
        .await
        .map_err(|e| DdlError::mysql(format!("connecting to {coordinator}"), e))?;
    let records = session
        .server_catalogue()
        .await
        .map_err(|e| DdlError::mysql(format!("reading catalogue on {coordinator}"), e));
    close(session).await;
    records
}

async fn probe_version(connector: &dyn Connector, instance: &Instance) -> Result<String, DdlError> {
    let unavailable = |e: MySqlError| DdlError::TopologyUnavailable(format!("{} {instance}: {e}", instance.role));
    let mut session = connector
        .connect(instance, "probe")
        .await
        .map_err(unavailable)?;
    let version = session.query_column("SELECT VERSION()").await;
    close(session).await;
    version
        .map_err(unavailable)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            DdlError::TopologyUnavailable(format!("{instance} returned no version"))
        })
}

/// Returns the physical name of logical database `db` on shard `shard`.
pub fn shard_physical_name(db: &str, shard: u32) -> String {
    format!("{db}_{shard}")
}

/// Splits a physical database name into its logical name and shard number.
pub fn parse_shard_physical_name(physical: &str) -> Option<(&str, u32)> {
    let (db, shard) = physical.rsplit_once('_')?;
    if db.is_empty() || shard.is_empty() || !shard.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((db, shard.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, host: &str, port: u16, wrapper: &str) -> ServerRecord {
        ServerRecord {
            server_name: name.into(),
            host: host.into(),
            port,
            username: "admin".into(),
            password: "secret".into(),
            wrapper: wrapper.into(),
        }
    }

    fn coordinator() -> Instance {
        Instance::new(
            "TDBCTL0",
            "10.0.0.9",
            26000,
            Credentials {
                user: "admin".into(),
                password: "secret".into(),
            },
            InstanceRole::Coordinator,
        )
    }

    fn catalogue() -> Vec<ServerRecord> {
        vec![
            record("SPIDER_SLAVE0", "10.0.0.6", 25000, "SPIDER_SLAVE"),
            record("SPT1", "10.0.0.2", 20001, "mysql"),
            record("SPT1_SLAVE", "10.0.0.3", 20001, "mysql_slave"),
            record("SPIDER0", "10.0.0.5", 25000, "SPIDER"),
            record("SPT0", "10.0.0.1", 20000, "mysql"),
            record("TDBCTL0", "10.0.0.9", 26000, "TDBCTL"),
        ]
    }

    #[test]
    fn test_classification_and_order() {
        let topology = Topology::from_catalogue(coordinator(), &catalogue(), &[]).unwrap();
        let shards: Vec<_> = topology.backends().iter().map(|b| b.shard()).collect();
        assert_eq!(shards, vec![Some(0), Some(1)]);
        let routers: Vec<_> = topology.routers().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(routers, vec!["SPIDER0", "SPIDER_SLAVE0"]);
    }

    #[test]
    fn test_maintenance_routers_are_last() {
        let mut maintenance = coordinator();
        maintenance.name = "maintenance".into();
        maintenance.role = InstanceRole::RouterMaster;
        let topology =
            Topology::from_catalogue(coordinator(), &catalogue(), &[maintenance]).unwrap();
        let last = topology.routers().last().unwrap();
        assert_eq!(last.role, InstanceRole::RouterMaintenance);
    }

    #[test]
    fn test_rejects_bad_catalogue() {
        let mut records = catalogue();
        records.push(record("SPTX", "10.0.0.7", 20000, "mysql"));
        assert!(matches!(
            Topology::from_catalogue(coordinator(), &records, &[]),
            Err(DdlError::TopologyUnavailable(_))
        ));

        let records = vec![record("SPIDER0", "10.0.0.5", 25000, "SPIDER")];
        assert!(Topology::from_catalogue(coordinator(), &records, &[]).is_err());
    }

    #[test]
    fn test_verify_catalogue_detects_drift() {
        let topology = Topology::from_catalogue(coordinator(), &catalogue(), &[]).unwrap();
        topology.verify_catalogue(&catalogue()).unwrap();

        let mut moved = catalogue();
        moved[1].host = "10.0.0.4".into();
        let err = topology.verify_catalogue(&moved).unwrap_err();
        assert!(matches!(err, DdlError::TopologyChanged(_)));
        assert!(err.to_string().contains("10.0.0.4:20001"));
    }

    #[test]
    fn test_newer_router_family() {
        let mut router = coordinator();
        router.role = InstanceRole::RouterSlave;
        assert!(!router.disables_ddl_forwarding());
        router.version = Some("5.7.20-tspider-3.7.8-log".into());
        assert!(!router.disables_ddl_forwarding());
        router.version = Some("5.7.20-tspider-4.0.1-log".into());
        assert!(router.disables_ddl_forwarding());
    }

    #[test]
    fn test_physical_names() {
        assert_eq!(shard_physical_name("db_1", 3), "db_1_3");
        assert_eq!(parse_shard_physical_name("db_1_3"), Some(("db_1", 3)));
        assert_eq!(parse_shard_physical_name("mysql"), None);
        assert_eq!(parse_shard_physical_name("db_"), None);
        assert_eq!(parse_shard_physical_name("db_x"), None);
    }

    #[test]
    fn test_debug_hides_password() {
        let rendered = format!("{:?}", coordinator());
        assert!(!rendered.contains("secret"));
    }
}
