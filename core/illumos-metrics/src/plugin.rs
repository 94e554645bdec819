//! Collector plugins.
//!
//! Every collector is a plugin. Its lifecycle is:
//! 1. The agent reads the configuration and calls [`PluginMetadata::init`] with the
//!    plugin's section of the config.
//! 2. [`Plugin::start`] registers the plugin's sources with [`PluginStart::add_source`].
//! 3. The agent polls the sources.
//! 4. [`Plugin::stop`] is called when the agent shuts down.
//!
//! To write a plugin, implement [`CollectorPlugin`]:
//!
//! ```
//! use illumos_metrics::{
//!     measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
//!     plugin::{CollectorPlugin, ConfigTable, PluginStart},
//!     source::{PollError, Source},
//! };
//!
//! struct UptimePlugin;
//!
//! impl CollectorPlugin for UptimePlugin {
//!     fn name() -> &'static str {
//!         "uptime"
//!     }
//!
//!     fn version() -> &'static str {
//!         env!("CARGO_PKG_VERSION")
//!     }
//!
//!     fn default_config() -> anyhow::Result<Option<ConfigTable>> {
//!         Ok(None)
//!     }
//!
//!     fn init(_config: ConfigTable) -> anyhow::Result<Box<Self>> {
//!         Ok(Box::new(UptimePlugin))
//!     }
//!
//!     fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
//!         start.add_source("uptime", Box::new(UptimeSource))
//!     }
//!
//!     fn stop(&mut self) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! struct UptimeSource;
//!
//! impl Source for UptimeSource {
//!     fn poll(&mut self, acc: &mut MeasurementAccumulator, t: Timestamp) -> Result<(), PollError> {
//!         acc.push(MeasurementPoint::new(t, "uptime").with_field("seconds", 42_u64));
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};

use crate::{command::CommandRunner, kstat::KstatReader, source::Source};

/// The configuration section of a plugin.
pub type ConfigTable = toml::Table;

/// Trait for collector plugins.
///
/// Implement this trait to define your plugin.
pub trait CollectorPlugin {
    fn name() -> &'static str;
    fn version() -> &'static str;

    /// Returns the default configuration of the plugin, if it has one.
    fn default_config() -> anyhow::Result<Option<ConfigTable>>;

    /// Initializes the plugin from its configuration.
    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>>;

    /// Starts the plugin, allowing it to register its sources.
    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()>;

    /// Stops the plugin. Its sources have already been dropped.
    fn stop(&mut self) -> anyhow::Result<()>;
}

/// Object-safe version of [`CollectorPlugin`].
///
/// You should not implement this trait manually: every [`CollectorPlugin`] is a `Plugin`.
pub trait Plugin {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
}

impl<P: CollectorPlugin> Plugin for P {
    fn name(&self) -> &str {
        P::name()
    }

    fn version(&self) -> &str {
        P::version()
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        CollectorPlugin::start(self, start)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        CollectorPlugin::stop(self)
    }
}

/// Information about a plugin that has not been initialized yet.
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub default_config: fn() -> anyhow::Result<Option<ConfigTable>>,
    pub init: Box<dyn FnOnce(ConfigTable) -> anyhow::Result<Box<dyn Plugin>>>,
}

impl PluginMetadata {
    pub fn from_static<P: CollectorPlugin + 'static>() -> Self {
        Self {
            name: P::name().to_owned(),
            version: P::version().to_owned(),
            default_config: P::default_config,
            init: Box::new(|conf| P::init(conf).map(|p| p as _)),
        }
    }
}

/// Builds a `Vec<PluginMetadata>` from a list of plugin types.
///
/// ```ignore
/// let plugins = static_plugins![ZpoolPlugin, FmaPlugin];
/// ```
#[macro_export]
macro_rules! static_plugins {
    [] => {
        Vec::<$crate::plugin::PluginMetadata>::new()
    };
    [$( $(#[$m:meta])* $x:path ),+ $(,)?] => {
        {
            vec![
                $(
                    $(#[$m])*
                    $crate::plugin::PluginMetadata::from_static::<$x>(),
                )*
            ] as Vec<$crate::plugin::PluginMetadata>
        }
    }
}

/// A source registered by a plugin.
pub struct RegisteredSource {
    pub plugin: String,
    pub name: String,
    pub source: Box<dyn Source>,
}

impl RegisteredSource {
    /// The full name of the source, `plugin/source`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.plugin, self.name)
    }
}

/// Given to [`Plugin::start`]: gives access to the system and registers sources.
pub struct PluginStart<'a> {
    plugin: &'a str,
    runner: Arc<dyn CommandRunner>,
    kstat: Arc<dyn KstatReader>,
    sources: &'a mut Vec<RegisteredSource>,
}

impl<'a> PluginStart<'a> {
    pub(crate) fn new(
        plugin: &'a str,
        runner: Arc<dyn CommandRunner>,
        kstat: Arc<dyn KstatReader>,
        sources: &'a mut Vec<RegisteredSource>,
    ) -> Self {
        Self {
            plugin,
            runner,
            kstat,
            sources,
        }
    }

    /// The name of the plugin being started.
    pub fn plugin_name(&self) -> &str {
        self.plugin
    }

    /// The runner to use for external commands.
    pub fn command_runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    /// The reader to use for kernel statistics.
    pub fn kstat_reader(&self) -> Arc<dyn KstatReader> {
        self.kstat.clone()
    }

    /// Registers a source. Its name must be unique among the sources of the plugin.
    pub fn add_source(&mut self, name: &str, source: Box<dyn Source>) -> anyhow::Result<()> {
        if self.sources.iter().any(|s| s.plugin == self.plugin && s.name == name) {
            anyhow::bail!("plugin {} already has a source named {name}", self.plugin);
        }
        self.sources.push(RegisteredSource {
            plugin: self.plugin.to_owned(),
            name: name.to_owned(),
            source,
        });
        Ok(())
    }
}

/// Deserializes the config of a plugin.
pub fn deserialize_config<T: DeserializeOwned>(config: ConfigTable) -> anyhow::Result<T> {
    config.try_into().context("invalid plugin config")
}

/// Serializes the config of a plugin, typically its default config.
pub fn serialize_config<T: Serialize>(config: T) -> anyhow::Result<ConfigTable> {
    toml::Table::try_from(config).context("could not serialize the plugin config")
}
