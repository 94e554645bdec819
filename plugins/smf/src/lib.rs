use std::sync::Arc;

use illumos_metrics::{
    command::{CommandRunner, Elevation},
    filter::want,
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
    text::{ServiceState, parse_svcs_line},
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub const SVCS_BINARY: &str = "/bin/svcs";

/// Counts the SMF services of each zone, by state.
pub struct SmfPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Service states to count, like `online` or `maintenance`. Empty means all of them.
    pub svc_states: Vec<String>,
    /// Zones whose services are counted. Empty means all of them.
    pub zones: Vec<String>,
    /// Also emit one point per service that is not online.
    pub generate_details: bool,
    /// Listing the services of every zone needs privileges. With `"none"`, only the services
    /// of the current zone are listed.
    pub elevate_privs_with: Elevation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            svc_states: Vec::new(),
            zones: Vec::new(),
            generate_details: true,
            elevate_privs_with: Elevation::With(String::from("/bin/pfexec")),
        }
    }
}

impl CollectorPlugin for SmfPlugin {
    fn name() -> &'static str {
        "smf"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(SmfPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let source = SmfSource {
            config: self.config.clone(),
            runner: start.command_runner(),
        };
        start.add_source("services", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct SmfSource {
    config: Config,
    runner: Arc<dyn CommandRunner>,
}

/// Service counts of each `(zone, state)`, and the services that are not online.
#[derive(Debug, Default)]
struct Summary {
    counts: FxHashMap<(String, String), u64>,
    not_online: Vec<ServiceState>,
}

impl SmfSource {
    fn list_services(&self) -> anyhow::Result<String> {
        // -Z lists the services of every zone, and needs privileges
        let elevation = &self.config.elevate_privs_with;
        if elevation.is_none() {
            elevation.run(self.runner.as_ref(), SVCS_BINARY, &["-aH", "-ozone,state,fmri"])
        } else {
            elevation.run(self.runner.as_ref(), SVCS_BINARY, &["-aHZ", "-ozone,state,fmri"])
        }
    }

    fn summarize(&self, output: &str) -> Summary {
        let mut summary = Summary::default();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let Some(service) = parse_svcs_line(line) else {
                log::warn!("could not parse service {line:?}");
                continue;
            };
            if !want(&service.zone, &self.config.zones) || !want(&service.state, &self.config.svc_states) {
                continue;
            }
            *summary
                .counts
                .entry((service.zone.clone(), service.state.clone()))
                .or_default() += 1;
            if self.config.generate_details && service.state != "online" {
                summary.not_online.push(service);
            }
        }
        summary
    }
}

impl Source for SmfSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let output = self.list_services().retry_poll()?;
        let summary = self.summarize(&output);

        let mut counts: Vec<_> = summary.counts.into_iter().collect();
        counts.sort_unstable();
        for ((zone, state), count) in counts {
            acc.push(
                MeasurementPoint::new(timestamp, "smf")
                    .with_tag("zone", zone)
                    .with_tag("state", state)
                    .with_field("states", count),
            );
        }

        for service in summary.not_online {
            acc.push(
                MeasurementPoint::new(timestamp, "smf")
                    .with_tag("zone", service.zone)
                    .with_tag("state", service.state)
                    .with_tag("fmri", service.fmri)
                    .with_field("errors", 1_u64),
            );
        }
        Ok(())
    }
}
