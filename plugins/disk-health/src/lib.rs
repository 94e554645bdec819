//! Disk error counters, from the kstats of class `device_error`.
//!
//! Statistic names like `Soft Errors` are camelCased into field and tag names: `softErrors`.

use std::sync::Arc;

use illumos_metrics::{
    filter::want,
    kstat::{KstatReader, KstatSelector, NamedStat, group_by_kstat, read_stats},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
    text::camel_case,
    units::unbytify,
};
use serde::{Deserialize, Serialize};

pub struct DiskHealthPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Devices to report on, like `sd6`. Empty means all of them.
    pub devices: Vec<String>,
    /// Statistics reported as fields. Empty means all of them.
    pub fields: Vec<String>,
    /// Statistics reported as tags. A device that lacks one is still reported.
    pub tags: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let list = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        Self {
            devices: Vec::new(),
            fields: list(&["Hard Errors", "Soft Errors", "Transport Errors", "Illegal Request"]),
            tags: list(&["Vendor", "Serial No", "Product", "Revision"]),
        }
    }
}

impl CollectorPlugin for DiskHealthPlugin {
    fn name() -> &'static str {
        "disk-health"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(DiskHealthPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let source = DiskHealthSource {
            config: self.config.clone(),
            kstat: start.kstat_reader(),
        };
        start.add_source("device_error", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Returns the device of an error kstat: `sd6` for `sd6,err`.
pub fn device_name(kstat_name: &str) -> &str {
    kstat_name.split(',').next().unwrap_or(kstat_name)
}

struct DiskHealthSource {
    config: Config,
    kstat: Arc<dyn KstatReader>,
}

impl DiskHealthSource {
    /// Turns the statistics of one device into fields and tags.
    fn fill(&self, point: &mut MeasurementPoint, stats: &[&NamedStat]) {
        for stat in stats {
            let name = stat.statistic.as_str();
            let Some(camel) = camel_case(name) else {
                continue;
            };
            if want(name, &self.config.fields) {
                match stat.value.as_f64() {
                    Some(value) => point.add_field(camel, value),
                    None => log::trace!("{name} is not a number"),
                }
            } else if name == "Size" && want(name, &self.config.tags) {
                if let Some(size) = stat.value.as_f64() {
                    point.add_tag("size", unbytify(size));
                }
            } else if want(name, &self.config.tags) {
                point.add_tag(camel, stat.value.to_string());
            }
        }
    }
}

impl Source for DiskHealthSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let selector = KstatSelector::default().class("device_error");
        let stats = read_stats(self.kstat.as_ref(), &selector).retry_poll()?;

        for (key, stats) in group_by_kstat(&stats) {
            let device = device_name(key.name);
            if !want(device, &self.config.devices) {
                continue;
            }
            let mut point = MeasurementPoint::new(timestamp, "diskHealth").with_tag("device", device);
            self.fill(&mut point, &stats);
            acc.push(point);
        }
        Ok(())
    }
}
