//! Loading of plugins and polling of their sources.
//!
//! ```no_run
//! use illumos_metrics::{
//!     agent::{self, PluginSet, UnknownPluginPolicy},
//!     measurement::Timestamp,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut config = toml::Table::new();
//! let mut plugins = PluginSet::new(vec![/* static_plugins![...] */]);
//! plugins.extract_config(&mut config, true, UnknownPluginPolicy::LogWarn)?;
//!
//! let mut agent = agent::Builder::new(plugins).build_and_start()?;
//! for point in &agent.poll_once(Timestamp::now()) {
//!     println!("{point}");
//! }
//! agent.stop();
//! # Ok(())
//! # }
//! ```

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, anyhow};
use thiserror::Error;

use crate::{
    command::{CommandRunner, SystemCommandRunner},
    kstat::{self, KstatReader},
    measurement::{MeasurementBuffer, Timestamp},
    plugin::{ConfigTable, Plugin, PluginMetadata, PluginStart, RegisteredSource},
};

/// Information about a plugin that has not been created yet
/// (i.e. [`PluginMetadata::init`] has not been called).
pub struct PluginInfo {
    pub metadata: PluginMetadata,
    pub enabled: bool,
    pub config: Option<ConfigTable>,
}

impl PluginInfo {
    fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            enabled: true,
            config: None,
        }
    }
}

/// A set of non-created plugins, with their metadata and configuration, sorted by name.
#[derive(Default)]
pub struct PluginSet(BTreeMap<String, PluginInfo>);

/// How to react when the config contains an unknown plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownPluginPolicy {
    /// Logs a warning message and continues.
    LogWarn,
    /// Returns an error.
    Error,
    /// Ignores the plugin config and continues.
    Ignore,
}

impl PluginSet {
    /// Creates a new plugin set from their metadata.
    ///
    /// Every plugin is marked as enabled. No configuration is attached to the plugins.
    pub fn new(metadata: Vec<PluginMetadata>) -> Self {
        Self(
            metadata
                .into_iter()
                .map(|m| (m.name.clone(), PluginInfo::new(m)))
                .collect(),
        )
    }

    /// Enables the specified plugins and disables all the others.
    ///
    /// Returns an error if a name does not match any plugin.
    pub fn enable_only(&mut self, plugin_names: &[impl AsRef<str>]) -> anyhow::Result<()> {
        for p in self.0.values_mut() {
            p.enabled = false;
        }
        for name in plugin_names {
            let name = name.as_ref();
            let plugin = self
                .0
                .get_mut(name)
                .ok_or_else(|| anyhow!("unknown plugin '{name}'"))?;
            plugin.enabled = true;
        }
        Ok(())
    }

    /// Extracts the config of each plugin from the `plugins` table of the global config.
    ///
    /// If `update_status` is true, enables or disables the plugins according to the
    /// configuration field `enabled`. If the field is not present, the plugin is enabled.
    pub fn extract_config(
        &mut self,
        global_config: &mut toml::Table,
        update_status: bool,
        on_unknown: UnknownPluginPolicy,
    ) -> anyhow::Result<()> {
        let extracted = extract_plugins_config(global_config).context("invalid config")?;
        for (plugin_name, (enabled, config)) in extracted {
            if let Some(plugin_info) = self.0.get_mut(&plugin_name) {
                if update_status {
                    plugin_info.enabled = enabled;
                }
                plugin_info.config = Some(config);
            } else {
                match on_unknown {
                    UnknownPluginPolicy::LogWarn => log::warn!("unknown plugin '{plugin_name}' in configuration"),
                    UnknownPluginPolicy::Error => {
                        return Err(anyhow!("unknown plugin '{plugin_name}' in configuration"));
                    }
                    UnknownPluginPolicy::Ignore => (),
                }
            }
        }
        Ok(())
    }

    pub fn get_plugin(&self, plugin_name: &str) -> Option<&PluginInfo> {
        self.0.get(plugin_name)
    }

    /// Checks if a plugin is enabled. If the plugin is not in the set, returns `false`.
    pub fn is_plugin_enabled(&self, plugin_name: &str) -> bool {
        self.0.get(plugin_name).is_some_and(|p| p.enabled)
    }

    /// Adds a new plugin to the set, replacing any plugin of the same name.
    pub fn add_plugin(&mut self, plugin: PluginInfo) {
        self.0.insert(plugin.metadata.name.clone(), plugin);
    }

    /// Iterates on the metadata of every plugin, enabled or not, sorted by name.
    pub fn metadata(&self) -> impl Iterator<Item = &PluginMetadata> {
        self.0.values().map(|p| &p.metadata)
    }

    /// Generates a table containing the default configuration of each plugin.
    pub fn default_config(&self) -> anyhow::Result<toml::Table> {
        let mut plugins = toml::Table::new();
        for p in self.metadata() {
            let config = (p.default_config)()
                .with_context(|| format!("plugin {} failed to generate a default configuration", p.name))?;
            if let Some(config) = config {
                plugins.insert(p.name.clone(), toml::Value::Table(config));
            }
        }
        let mut global = toml::Table::new();
        global.insert("plugins".to_owned(), toml::Value::Table(plugins));
        Ok(global)
    }

    /// Consumes the set and returns two lists: the enabled plugins, and the disabled plugins.
    pub fn into_partition(self) -> (Vec<PluginInfo>, Vec<PluginInfo>) {
        self.0.into_values().partition(|p| p.enabled)
    }
}

#[derive(Error, Debug)]
#[error("unexpected type for {path}: expected {expected}, got {actual}")]
pub struct BadTypeError {
    pub path: String,
    pub expected: &'static str,
    pub actual: &'static str,
}

impl BadTypeError {
    fn new(path: String, expected: &'static str, actual: &toml::Value) -> Self {
        Self {
            path,
            expected,
            actual: actual.type_str(),
        }
    }
}

/// Removes the `plugins` table from the config, and returns the config of each plugin,
/// with its `enabled` flag (`true` by default) removed from the table.
pub fn extract_plugins_config(config: &mut toml::Table) -> Result<BTreeMap<String, (bool, ConfigTable)>, BadTypeError> {
    let plugins_table = match config.remove("plugins") {
        Some(toml::Value::Table(t)) => t,
        Some(bad) => return Err(BadTypeError::new(String::from("plugins"), "table", &bad)),
        None => toml::Table::new(),
    };

    let mut res = BTreeMap::new();
    for (plugin, section) in plugins_table {
        let mut plugin_config = match section {
            toml::Value::Table(t) => t,
            bad => return Err(BadTypeError::new(format!("plugins.{plugin}"), "table", &bad)),
        };
        let enabled_val = plugin_config.remove("enabled").unwrap_or(toml::Value::Boolean(true));
        let enabled = enabled_val
            .as_bool()
            .ok_or_else(|| BadTypeError::new(format!("plugins.{plugin}.enabled"), "boolean", &enabled_val))?;
        res.insert(plugin, (enabled, plugin_config));
    }
    Ok(res)
}

#[derive(Error, Debug)]
#[error("could not load config from '{}'", .config_file.display())]
pub struct LoadError {
    pub config_file: PathBuf,
    #[source]
    kind: LoadErrorCause,
}

#[derive(Error, Debug)]
enum LoadErrorCause {
    #[error("read failed")]
    Read(#[source] std::io::Error),
    #[error("default provider returned an error")]
    DefaultProvider(#[source] anyhow::Error),
    #[error("write (of default config) failed")]
    DefaultWrite(#[source] std::io::Error),
    #[error("invalid TOML config")]
    InvalidToml(#[from] toml::de::Error),
}

/// Loads the config file. If it does not exist, writes the default config to it first.
pub fn load_config(
    path: &Path,
    default: impl FnOnce() -> anyhow::Result<toml::Table>,
) -> Result<toml::Table, LoadError> {
    let err = |kind| LoadError {
        config_file: path.to_owned(),
        kind,
    };
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let config = default().map_err(|e| err(LoadErrorCause::DefaultProvider(e)))?;
            let content = toml::to_string_pretty(&config).map_err(|e| err(LoadErrorCause::DefaultProvider(e.into())))?;
            fs::write(path, &content).map_err(|e| err(LoadErrorCause::DefaultWrite(e)))?;
            log::info!("default configuration written to {}", path.display());
            content
        }
        Err(e) => return Err(err(LoadErrorCause::Read(e))),
    };
    content
        .parse::<toml::Table>()
        .map_err(|e| err(LoadErrorCause::InvalidToml(e)))
}

/// Builds an [`Agent`].
pub struct Builder {
    plugins: PluginSet,
    runner: Option<Arc<dyn CommandRunner>>,
    kstat: Option<Arc<dyn KstatReader>>,
}

impl Builder {
    pub fn new(plugins: PluginSet) -> Self {
        Self {
            plugins,
            runner: None,
            kstat: None,
        }
    }

    /// Uses this runner instead of [`SystemCommandRunner`].
    pub fn with_command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Uses this reader instead of the one returned by [`kstat::system_reader`].
    pub fn with_kstat_reader(mut self, kstat: Arc<dyn KstatReader>) -> Self {
        self.kstat = Some(kstat);
        self
    }

    /// Initializes and starts every enabled plugin.
    pub fn build_and_start(self) -> anyhow::Result<Agent> {
        let runner = self.runner.unwrap_or_else(|| Arc::new(SystemCommandRunner));
        let kstat = self.kstat.unwrap_or_else(|| kstat::system_reader(runner.clone()));
        Agent::start(self.plugins, runner, kstat)
    }
}

/// Started plugins and their sources.
pub struct Agent {
    plugins: Vec<Box<dyn Plugin>>,
    sources: Vec<RegisteredSource>,
}

impl Agent {
    /// Initializes and starts every enabled plugin of the set.
    ///
    /// Fails if a plugin cannot be initialized or started.
    pub fn start(
        plugins: PluginSet,
        runner: Arc<dyn CommandRunner>,
        kstat: Arc<dyn KstatReader>,
    ) -> anyhow::Result<Self> {
        let (enabled, disabled) = plugins.into_partition();
        if !disabled.is_empty() {
            let names: Vec<&str> = disabled.iter().map(|p| p.metadata.name.as_str()).collect();
            log::debug!("disabled plugins: {}", names.join(", "));
        }

        let mut agent = Agent {
            plugins: Vec::with_capacity(enabled.len()),
            sources: Vec::new(),
        };
        for info in enabled {
            let name = info.metadata.name;
            let config = info.config.unwrap_or_default();
            let mut plugin = (info.metadata.init)(config).with_context(|| format!("plugin {name} failed to initialize"))?;
            let mut start = PluginStart::new(&name, runner.clone(), kstat.clone(), &mut agent.sources);
            plugin
                .start(&mut start)
                .with_context(|| format!("plugin {name} failed to start"))?;
            log::info!("plugin {name} v{} started", plugin.version());
            agent.plugins.push(plugin);
        }
        Ok(agent)
    }

    /// Names of the registered sources, as `plugin/source`.
    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(RegisteredSource::full_name).collect()
    }

    /// Polls every source once, and returns all the measurements.
    ///
    /// A source that fails does not prevent the others from being polled. The measurements
    /// that it produced before failing are kept. A source that fails with
    /// [`PollError::Fatal`](crate::source::PollError::Fatal) is removed.
    pub fn poll_once(&mut self, timestamp: Timestamp) -> MeasurementBuffer {
        let mut buffer = MeasurementBuffer::new();
        self.sources.retain_mut(|registered| {
            let mut local = MeasurementBuffer::new();
            let res = registered.source.poll(&mut local.as_accumulator(), timestamp);
            buffer.merge(&mut local);
            match res {
                Ok(()) => true,
                Err(e) if e.is_fatal() => {
                    log::error!("source {} removed: {e}", registered.full_name());
                    false
                }
                Err(e) => {
                    log::warn!("source {}: {e}", registered.full_name());
                    true
                }
            }
        });
        buffer
    }

    /// Drops the sources and stops every plugin.
    pub fn stop(mut self) {
        self.sources.clear();
        for plugin in &mut self.plugins {
            if let Err(e) = plugin.stop() {
                log::error!("plugin {} failed to stop: {e:#}", plugin.name());
            }
        }
    }
}
