use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::UNIX_EPOCH,
};

use anyhow::Context;
use illumos_metrics::{
    command::{CommandRunner, stdout_of},
    inventory::{ZoneMap, parse_zones},
    kstat::{KstatReader, KstatSelector},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub const ZONEADM_BINARY: &str = "/usr/sbin/zoneadm";

/// Uptime of a zone whose boot time is unknown, typically because it is not running.
pub const UNKNOWN_UPTIME: f64 = -1.0;

/// Reports the uptime and the age of the non-global zones.
pub struct ZonesPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Where `zonecfg` writes the `<zone>.xml` files. Their mtime is the age of the zones.
    pub zone_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zone_dir: PathBuf::from("/etc/zones"),
        }
    }
}

impl CollectorPlugin for ZonesPlugin {
    fn name() -> &'static str {
        "zones"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(ZonesPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let source = ZonesSource {
            zone_dir: self.config.zone_dir.clone(),
            runner: start.command_runner(),
            kstat: start.kstat_reader(),
        };
        start.add_source("zones", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ZonesSource {
    zone_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    kstat: Arc<dyn KstatReader>,
}

impl ZonesSource {
    /// Boot times of the zones, read from the `zones` kstats in one go.
    ///
    /// The instance of a `zones` kstat is the zone id. Kstats of zones that
    /// `zoneadm` did not list are ignored.
    fn boot_times(&self, zones: &ZoneMap) -> FxHashMap<String, f64> {
        let selector = KstatSelector::module("zones").statistic("boot_time");
        let stats = match self.kstat.read(&selector) {
            Ok(stats) => stats,
            Err(e) => {
                log::debug!("no boot time for the zones: {e:#}");
                return FxHashMap::default();
            }
        };
        stats
            .into_iter()
            .filter_map(|stat| {
                let zone = zones.zone_by_id(stat.instance).filter(|z| z.name == stat.name)?;
                Some((zone.name.clone(), stat.value.as_f64()?))
            })
            .collect()
    }
}

/// Seconds since the configuration file of the zone was modified.
fn zone_age(zone_dir: &Path, zone: &str, now: f64) -> anyhow::Result<f64> {
    let path = zone_dir.join(format!("{zone}.xml"));
    let mtime = fs::metadata(&path)
        .and_then(|m| m.modified())
        .with_context(|| format!("could not get the mtime of {}", path.display()))?;
    let mtime = mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    Ok(now - mtime as f64)
}

impl Source for ZonesSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let output = stdout_of(self.runner.as_ref(), ZONEADM_BINARY, &["list", "-cp"]).retry_poll()?;
        let zones = parse_zones(&output);
        let boot_times = self.boot_times(&zones);
        let now = timestamp.to_unix_timestamp().0 as f64;

        for name in zones.names().into_iter().filter(|n| *n != "global") {
            let Some(zone) = zones.get(name) else {
                continue;
            };
            let point = MeasurementPoint::new(timestamp, "zones")
                .with_tag("name", name)
                .with_tag("status", &zone.state)
                .with_tag("ipType", &zone.ip_type)
                .with_tag("brand", &zone.brand);

            let uptime = boot_times.get(name).map_or(UNKNOWN_UPTIME, |boot| now - boot);
            match zone_age(&self.zone_dir, name, now) {
                Ok(age) => {
                    acc.push(point.clone().with_field("uptime", uptime));
                    acc.push(point.with_field("age", age));
                }
                Err(e) => {
                    log::debug!("{e:#}");
                    acc.push(point.with_field("uptime", uptime));
                }
            }
        }
        Ok(())
    }
}
