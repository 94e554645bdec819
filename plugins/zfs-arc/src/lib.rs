use std::sync::Arc;

use illumos_metrics::{
    filter::want_field,
    kstat::{KstatReader, KstatSelector, read_stats},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
};
use serde::{Deserialize, Serialize};

/// Reports the statistics of the ZFS adaptive replacement cache.
pub struct ZfsArcPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Statistics of `zfs:0:arcstats` to report. Empty means all of them.
    pub fields: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let fields = [
            "hits",
            "misses",
            "l2_hits",
            "l2_misses",
            "prefetch_data_hits",
            "prefetch_data_misses",
            "prefetch_metadata_hits",
            "prefetch_metadata_misses",
            "demand_data_hits",
            "demand_data_misses",
            "demand_metadata_hits",
            "demand_metadata_misses",
            "l2_size",
            "l2_read_bytes",
            "l2_write_bytes",
            "l2_cksum_bad",
            "c",
            "size",
        ];
        Self {
            fields: fields.into_iter().map(String::from).collect(),
        }
    }
}

impl CollectorPlugin for ZfsArcPlugin {
    fn name() -> &'static str {
        "zfs-arc"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(ZfsArcPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let source = ArcSource {
            fields: self.config.fields.clone(),
            kstat: start.kstat_reader(),
        };
        start.add_source("arcstats", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ArcSource {
    fields: Vec<String>,
    kstat: Arc<dyn KstatReader>,
}

impl Source for ArcSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let selector = KstatSelector::module("zfs").instance(0).name("arcstats");
        let stats = read_stats(self.kstat.as_ref(), &selector).retry_poll()?;

        let mut point = MeasurementPoint::new(timestamp, "zfs.arcstats");
        for stat in stats.into_iter().filter(|s| want_field(&s.statistic, &self.fields)) {
            match stat.value.as_f64() {
                Some(value) => point.add_field(stat.statistic, value),
                None => log::trace!("arcstats {} is not a number", stat.statistic),
            }
        }
        acc.push(point);
        Ok(())
    }
}
