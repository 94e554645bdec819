//! Network usage of the datalinks, attributed to zones.
//!
//! Every datalink has a kstat `link:0:<link>`. The VNICs of the non-global zones are found with
//! `dladm`, which tells which zone each of them belongs to. The other links belong to the zone
//! in which the agent runs.

use anyhow::Context;
use illumos_metrics::{
    command::stdout_of,
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
};
use serde::{Deserialize, Serialize};

mod source;

pub use source::{LinkTags, NetworkSource, link_tags};

pub const DLADM_BINARY: &str = "/usr/sbin/dladm";
pub const ZONENAME_BINARY: &str = "/bin/zonename";

pub struct NetworkPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Statistics to report, see `kstat -c net`. Empty means all of them, which is a lot.
    pub fields: Vec<String>,
    /// Links to report. Empty means all of them.
    pub vnics: Vec<String>,
    /// Zones whose links are reported. Empty means all of them.
    pub zones: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fields: vec![String::from("obytes64"), String::from("rbytes64")],
            vnics: Vec::new(),
            zones: Vec::new(),
        }
    }
}

impl CollectorPlugin for NetworkPlugin {
    fn name() -> &'static str {
        "network"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(NetworkPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let runner = start.command_runner();
        let current_zone = stdout_of(runner.as_ref(), ZONENAME_BINARY, &[])
            .context("could not get the name of the current zone")?
            .trim()
            .to_owned();
        if current_zone.is_empty() {
            anyhow::bail!("{ZONENAME_BINARY} printed nothing");
        }
        log::debug!("links without a vnic belong to zone {current_zone}");

        let source = NetworkSource::new(self.config.clone(), current_zone, runner, start.kstat_reader());
        start.add_source("links", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
