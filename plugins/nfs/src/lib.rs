//! NFS operation counters, for the client and the server side.

use std::sync::Arc;

use illumos_metrics::{
    filter::{want, want_field},
    kstat::{KstatReader, KstatSelector, group_by_kstat, read_stats},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
};
use serde::{Deserialize, Serialize};

pub struct NfsPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Report the requests sent by the NFS client.
    pub client_on: bool,
    /// Like `v3` or `v4`. Empty means all of them.
    pub client_versions: Vec<String>,
    /// Operations to report, like `read` or `getattr`. Empty means all of them.
    pub client_fields: Vec<String>,

    /// Report the requests handled by the NFS server.
    pub server_on: bool,
    pub server_versions: Vec<String>,
    pub server_fields: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let list = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        let fields = ["read", "write", "remove", "create", "getattr", "setattr"];
        Self {
            client_on: true,
            client_versions: list(&["v3", "v4"]),
            client_fields: list(&fields),
            server_on: true,
            server_versions: list(&["v3", "v4"]),
            server_fields: list(&fields),
        }
    }
}

impl CollectorPlugin for NfsPlugin {
    fn name() -> &'static str {
        "nfs"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(NfsPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let c = &self.config;
        if c.client_on {
            let source = NfsSource::new(Side::Client, &c.client_versions, &c.client_fields, start.kstat_reader());
            start.add_source("client", Box::new(source))?;
        }
        if c.server_on {
            let source = NfsSource::new(Side::Server, &c.server_versions, &c.server_fields, start.kstat_reader());
            start.add_source("server", Box::new(source))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// Prefix of the kstats that count the operations, followed by the protocol version.
    fn kstat_prefix(self) -> &'static str {
        match self {
            Side::Client => "rfsreqcnt_v",
            Side::Server => "rfsproccnt_v",
        }
    }

    fn measurement(self) -> &'static str {
        match self {
            Side::Client => "nfs.client",
            Side::Server => "nfs.server",
        }
    }
}

/// Returns the protocol version counted by a kstat of `nfs:0`, like `v4` for `rfsproccnt_v4`.
pub fn nfs_version(kstat_name: &str, side: Side) -> Option<String> {
    kstat_name
        .strip_prefix(side.kstat_prefix())
        .filter(|v| !v.is_empty())
        .map(|v| format!("v{v}"))
}

/// Reports one point per NFS version, with the number of calls of each operation.
pub struct NfsSource {
    side: Side,
    versions: Vec<String>,
    fields: Vec<String>,
    kstat: Arc<dyn KstatReader>,
}

impl NfsSource {
    pub fn new(side: Side, versions: &[String], fields: &[String], kstat: Arc<dyn KstatReader>) -> Self {
        Self {
            side,
            versions: versions.to_vec(),
            fields: fields.to_vec(),
            kstat,
        }
    }
}

impl Source for NfsSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.kstat.as_ref(), &KstatSelector::module("nfs").instance(0)).retry_poll()?;

        for (key, stats) in group_by_kstat(&stats) {
            let Some(version) = nfs_version(key.name, self.side) else {
                continue;
            };
            if !want(&version, &self.versions) {
                continue;
            }
            let mut point = MeasurementPoint::new(timestamp, self.side.measurement()).with_tag("nfsVersion", version);
            for stat in stats.into_iter().filter(|s| want_field(&s.statistic, &self.fields)) {
                if let Some(value) = stat.value.as_f64() {
                    point.add_field(stat.statistic.clone(), value);
                }
            }
            acc.push(point);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions() {
        assert_eq!(nfs_version("rfsproccnt_v4", Side::Server).as_deref(), Some("v4"));
        assert_eq!(nfs_version("rfsreqcnt_v3", Side::Client).as_deref(), Some("v3"));
        assert_eq!(nfs_version("rfsreqcnt_v3", Side::Server), None);
        assert_eq!(nfs_version("aclproccnt_v3", Side::Server), None);
        assert_eq!(nfs_version("rfsproccnt_v", Side::Server), None);
    }
}
