//! Operating system release, reported as tags of a constant point.
//!
//! The point has a single field, `release = 1`, so that its tags can be joined with other metrics.

use std::sync::Arc;

use anyhow::Context;
use illumos_metrics::{
    command::{CommandRunner, stdout_of},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config},
    source::{PollError, Retryable, Source},
    text::parse_os_release,
};
use serde::{Deserialize, Serialize};

pub const UNAME_BINARY: &str = "/bin/uname";

/// Keys of the release file that become tags.
const RELEASE_TAGS: [&str; 3] = ["name", "version", "build_id"];

pub struct OsPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Path to the release file.
    pub os_release: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            os_release: String::from("/etc/os-release"),
        }
    }
}

impl CollectorPlugin for OsPlugin {
    fn name() -> &'static str {
        "os"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config = deserialize_config(config)?;
        Ok(Box::new(OsPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let source = OsSource {
            os_release: self.config.os_release.clone(),
            runner: start.command_runner(),
        };
        start.add_source("release", Box::new(source))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct OsSource {
    os_release: String,
    runner: Arc<dyn CommandRunner>,
}

impl Source for OsSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let text = std::fs::read_to_string(&self.os_release)
            .with_context(|| format!("could not read {}", self.os_release))
            .retry_poll()?;
        let mut release = parse_os_release(&text);

        let mut point = MeasurementPoint::new(timestamp, "os").with_field("release", 1_i64);
        for key in RELEASE_TAGS {
            if let Some(value) = release.remove(key) {
                point.add_tag(key, value);
            }
        }
        match stdout_of(self.runner.as_ref(), UNAME_BINARY, &["-v"]) {
            Ok(kernel) => point.add_tag("kernel", kernel.trim()),
            Err(e) => log::warn!("could not get the kernel version: {e:#}"),
        }
        acc.push(point);
        Ok(())
    }
}
