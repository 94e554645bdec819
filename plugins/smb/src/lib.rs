//! Statistics of the in-kernel SMB server.

use std::sync::Arc;

use illumos_metrics::{
    filter::want_field,
    kstat::{KstatReader, KstatSelector, group_by_kstat, read_stats},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
};
use serde::{Deserialize, Serialize};

pub struct SmbPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Statistics of the `smbsrv` kstats to report. Empty means all of them.
    pub fields: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fields: vec![String::from("open_files")],
        }
    }
}

impl CollectorPlugin for SmbPlugin {
    fn name() -> &'static str {
        "smb"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(SmbPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let source = SmbSource {
            fields: self.config.fields.clone(),
            kstat: start.kstat_reader(),
        };
        start.add_source("smbsrv", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One point per `smbsrv` kstat.
struct SmbSource {
    fields: Vec<String>,
    kstat: Arc<dyn KstatReader>,
}

impl Source for SmbSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.kstat.as_ref(), &KstatSelector::module("smbsrv")).retry_poll()?;
        for stats in group_by_kstat(&stats).into_values() {
            let mut point = MeasurementPoint::new(timestamp, "smb.server");
            for stat in stats.into_iter().filter(|s| want_field(&s.statistic, &self.fields)) {
                match stat.value.as_f64() {
                    Some(value) => point.add_field(stat.statistic.clone(), value),
                    None => log::trace!("smbsrv {} is not a number", stat.statistic),
                }
            }
            acc.push(point);
        }
        Ok(())
    }
}
