//! Fault management: the statistics of the fmd modules, and the faults that fmd diagnosed.

use illumos_metrics::{
    command::Elevation,
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
};
use serde::{Deserialize, Serialize};

mod fmadm;
mod fmstat;

pub use fmadm::FmadmSource;
pub use fmstat::FmstatSource;

pub const FMSTAT_BINARY: &str = "/usr/sbin/fmstat";
pub const FMADM_BINARY: &str = "/usr/sbin/fmadm";

pub struct FmaPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Report the statistics of `fmstat`.
    pub fmstat: bool,
    /// The fmd modules to report. Empty means all of them.
    pub fmstat_modules: Vec<String>,
    /// The `fmstat` columns to report. `%w` and `%b` are spelled `pc_w` and `pc_b`.
    pub fmstat_fields: Vec<String>,

    /// Report the faults listed by `fmadm faulty`.
    pub fmadm: bool,
    pub fmadm_mode: FmadmMode,

    /// `fmadm` needs privileges. With `"none"`, the faults are not reported.
    pub elevate_privs_with: Elevation,
}

/// How the faults are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FmadmMode {
    /// One point per impacted resource, tagged with the components of its URI.
    #[default]
    Impacts,
    /// One point that counts the faults of each problem class.
    Classes,
    /// One point that counts the impacted resources by status, like `faulted` or `degraded`.
    Statuses,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fmstat: true,
            fmstat_modules: Vec::new(),
            fmstat_fields: Vec::new(),
            fmadm: true,
            fmadm_mode: FmadmMode::default(),
            elevate_privs_with: Elevation::With(String::from("/bin/pfexec")),
        }
    }
}

impl CollectorPlugin for FmaPlugin {
    fn name() -> &'static str {
        "fma"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(FmaPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let config = &self.config;
        if config.fmstat {
            let source = FmstatSource::new(
                config.fmstat_modules.clone(),
                config.fmstat_fields.clone(),
                start.command_runner(),
            );
            start.add_source("fmstat", Box::new(source))?;
        }
        if config.fmadm {
            if config.elevate_privs_with.is_none() {
                log::info!("fmadm needs privileges and elevate_privs_with is \"none\": faults will not be reported");
            } else {
                let source = FmadmSource::new(
                    config.fmadm_mode,
                    config.elevate_privs_with.clone(),
                    start.command_runner(),
                );
                start.add_source("fmadm", Box::new(source))?;
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config() {
        let table = FmaPlugin::default_config().unwrap().unwrap();
        assert_eq!(
            table.get("elevate_privs_with").and_then(|v| v.as_str()),
            Some("/bin/pfexec")
        );
        assert_eq!(table.get("fmadm_mode").and_then(|v| v.as_str()), Some("impacts"));
        let plugin = FmaPlugin::init(table).unwrap();
        assert_eq!(plugin.config, Config::default());
    }

    #[test]
    fn parse_config() {
        let table: ConfigTable = toml::from_str(
            r#"
            fmstat_modules = ["zfs-retire"]
            fmadm_mode = "classes"
            elevate_privs_with = "none"
            "#,
        )
        .unwrap();
        let config = FmaPlugin::init(table).unwrap().config;
        assert_eq!(config.fmstat_modules, vec!["zfs-retire"]);
        assert_eq!(config.fmadm_mode, FmadmMode::Classes);
        assert_eq!(config.elevate_privs_with, Elevation::None);
    }
}
