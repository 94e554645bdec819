//! CPU usage: clock speed of each CPU, time spent by each zone and per-CPU `sys` counters.
//!
//! Every value is a raw kstat counter. Turn them into rates downstream.

use std::sync::Arc;

use illumos_metrics::{
    filter::want_field,
    kstat::{KstatReader, KstatSelector, NamedStat, group_by_kstat, read_stats},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
};
use serde::{Deserialize, Serialize};

pub struct CpuPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Report the clock speed of each CPU, from the `cpu_info` kstats.
    pub cpu_info_stats: bool,
    /// Report the system and user time of each zone.
    pub zone_cpu_stats: bool,
    /// Statistics of the `cpu:<n>:sys` kstats to report. Empty means all of them.
    pub sys_fields: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let sys_fields = ["cpu_nsec_dtrace", "cpu_nsec_intr", "cpu_nsec_kernel", "cpu_nsec_user"];
        Self {
            cpu_info_stats: true,
            zone_cpu_stats: true,
            sys_fields: sys_fields.into_iter().map(String::from).collect(),
        }
    }
}

impl CollectorPlugin for CpuPlugin {
    fn name() -> &'static str {
        "cpu"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(CpuPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        if self.config.cpu_info_stats {
            start.add_source("info", Box::new(CpuInfoSource(start.kstat_reader())))?;
        }
        if self.config.zone_cpu_stats {
            start.add_source("zone", Box::new(ZoneCpuSource(start.kstat_reader())))?;
        }
        let source = SysSource {
            fields: self.config.sys_fields.clone(),
            kstat: start.kstat_reader(),
        };
        start.add_source("sys", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Turns a `cpu:<n>:sys` statistic into a field name: `cpu_nsec_user` becomes `nsec.user`.
pub fn field_path(statistic: &str) -> String {
    statistic.replacen("cpu_", "", 1).replacen('_', ".", 1)
}

/// Tags of a `cpu.info` point, with the statistic they come from.
const INFO_TAGS: [(&str, &str); 4] = [
    ("clock_MHz", "clockMHz"),
    ("state", "state"),
    ("chip_id", "chipID"),
    ("core_id", "coreID"),
];

fn find<'a>(stats: &[&'a NamedStat], statistic: &str) -> Option<&'a NamedStat> {
    stats.iter().copied().find(|s| s.statistic == statistic)
}

/// Reports the current clock speed of each CPU.
struct CpuInfoSource(Arc<dyn KstatReader>);

impl Source for CpuInfoSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.0.as_ref(), &KstatSelector::module("cpu_info")).retry_poll()?;
        for stats in group_by_kstat(&stats).values() {
            let mut point = MeasurementPoint::new(timestamp, "cpu.info");
            if let Some(speed) = find(stats, "current_clock_Hz").and_then(|s| s.value.as_f64()) {
                point.add_field("speed", speed);
            }
            for (statistic, tag) in INFO_TAGS {
                if let Some(stat) = find(stats, statistic) {
                    point.add_tag(tag, stat.value.to_string());
                }
            }
            acc.push(point);
        }
        Ok(())
    }
}

/// Reports the time spent in system and user mode by each zone.
struct ZoneCpuSource(Arc<dyn KstatReader>);

impl Source for ZoneCpuSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.0.as_ref(), &KstatSelector::module("zones")).retry_poll()?;
        for (key, stats) in group_by_kstat(&stats) {
            // kstat names are truncated, zonename is not
            let name = find(&stats, "zonename").map_or_else(|| key.name.to_owned(), |s| s.value.to_string());
            let mut point = MeasurementPoint::new(timestamp, "cpu.zone").with_tag("name", name);
            for (statistic, field) in [("nsec_sys", "sys"), ("nsec_user", "user")] {
                if let Some(value) = find(&stats, statistic).and_then(|s| s.value.as_f64()) {
                    point.add_field(field, value);
                }
            }
            acc.push(point);
        }
        Ok(())
    }
}

/// Reports the `cpu:<n>:sys` counters, one point per CPU.
struct SysSource {
    fields: Vec<String>,
    kstat: Arc<dyn KstatReader>,
}

impl Source for SysSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.kstat.as_ref(), &KstatSelector::module("cpu").name("sys")).retry_poll()?;
        for (key, stats) in group_by_kstat(&stats) {
            let mut point = MeasurementPoint::new(timestamp, "cpu").with_tag("coreID", key.instance.to_string());
            for stat in stats.into_iter().filter(|s| want_field(&s.statistic, &self.fields)) {
                if let Some(value) = stat.value.as_f64() {
                    point.add_field(field_path(&stat.statistic), value);
                }
            }
            acc.push(point);
        }
        Ok(())
    }
}
