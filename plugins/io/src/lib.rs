//! Disk I/O counters, from the kstats of class `disk`.
//!
//! The points of `sd` devices are tagged with the serial number and the product name found in
//! the matching `sderr` kstat.

use std::sync::{Arc, LazyLock};

use illumos_metrics::{
    filter::{want, want_field},
    kstat::{KstatReader, KstatSelector, group_by_kstat, read_stats},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

static TRAILING_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+$").unwrap());

pub struct IoPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// I/O counters to report, like `nread` or `wlentime`. Empty means all of them.
    pub fields: Vec<String>,
    /// kstat modules to report on. Empty means all of them.
    pub modules: Vec<String>,
    /// Devices to report on, like `sd0`. Empty means all of them.
    pub devices: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let list = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        Self {
            fields: list(&["reads", "nread", "writes", "nwritten"]),
            modules: list(&["sd", "zfs"]),
            devices: Vec::new(),
        }
    }
}

impl CollectorPlugin for IoPlugin {
    fn name() -> &'static str {
        "io"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(IoPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let source = IoSource {
            config: self.config.clone(),
            kstat: start.kstat_reader(),
        };
        start.add_source("disk", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct IoSource {
    config: Config,
    kstat: Arc<dyn KstatReader>,
}

impl IoSource {
    /// Reads a statistic of the error kstat of a device, `sderr:<n>:<device>,err`.
    fn device_info(&self, device: &str, statistic: &str) -> Option<String> {
        let instance = TRAILING_DIGITS.find(device)?.as_str().parse().ok()?;
        let selector = KstatSelector::module("sderr")
            .instance(instance)
            .name(&format!("{device},err"))
            .statistic(statistic);
        match self.kstat.read_one(&selector) {
            Ok(value) => value.map(|v| v.to_string()),
            Err(e) => {
                log::debug!("no {statistic} for {device}: {e:#}");
                None
            }
        }
    }
}

impl Source for IoSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.kstat.as_ref(), &KstatSelector::default().class("disk")).retry_poll()?;

        for (key, stats) in group_by_kstat(&stats) {
            if !want(key.module, &self.config.modules) || !want(key.name, &self.config.devices) {
                continue;
            }
            let mut point = MeasurementPoint::new(timestamp, "io")
                .with_tag("module", key.module)
                .with_tag("device", key.name);
            for (tag, statistic) in [("serialNo", "Serial No"), ("product", "Product")] {
                if let Some(value) = self.device_info(key.name, statistic) {
                    point.add_tag(tag, value);
                }
            }
            for stat in stats.into_iter().filter(|s| want_field(&s.statistic, &self.config.fields)) {
                if let Some(value) = stat.value.as_f64() {
                    point.add_field(stat.statistic.clone(), value);
                }
            }
            acc.push(point);
        }
        Ok(())
    }
}
