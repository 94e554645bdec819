use illumos_metrics::plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config};
use serde::{Deserialize, Serialize};

mod source;

pub use source::ZpoolSource;

pub const ZPOOL_BINARY: &str = "/usr/sbin/zpool";

/// Reports the health, usage and status of ZFS pools.
pub struct ZpoolPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Columns of `zpool list` to report, like `size` or `cap`. Empty means all of them.
    pub fields: Vec<String>,

    /// Also report scrub and resilver times, and the error counts of each device.
    pub status: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fields: vec![
                String::from("size"),
                String::from("alloc"),
                String::from("free"),
                String::from("cap"),
                String::from("dedup"),
                String::from("health"),
            ],
            status: true,
        }
    }
}

impl CollectorPlugin for ZpoolPlugin {
    fn name() -> &'static str {
        "zpool"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        let config = serialize_config(Config::default())?;
        Ok(Some(config))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(ZpoolPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let source = ZpoolSource::new(self.config.clone(), start.command_runner())?;
        start.add_source("pools", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
