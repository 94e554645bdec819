use std::path::Path;

use anyhow::{Context, anyhow};
use clap::Parser;
use cli::{Action, Cli, CommonArgs, ConfigCommand, PluginsCommand};
use illumos_agent::{init_logger, load_plugins_metadata, plugin_line, write_measurements};
use illumos_metrics::{
    agent::{self, PluginSet, UnknownPluginPolicy},
    measurement::Timestamp,
};

fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Cli::parse();
    log::debug!("{} v{}", env!("CARGO_BIN_NAME"), env!("CARGO_PKG_VERSION"));

    let mut plugins = PluginSet::new(load_plugins_metadata());
    let plugins_from_args = args.common.plugins.is_some();
    if let Some(names) = &args.common.plugins {
        plugins.enable_only(names).context("invalid --plugins")?;
    }

    match args.command.unwrap_or(Action::Run) {
        Action::Config(ConfigCommand::Regen) => regen_config(&args.common.config, &plugins),
        Action::Plugins(PluginsCommand::List { status: false }) => {
            print_plugins(&plugins, false);
            Ok(())
        }
        Action::Plugins(PluginsCommand::List { status: true }) => {
            apply_config(&args.common, &mut plugins, !plugins_from_args)?;
            print_plugins(&plugins, true);
            Ok(())
        }
        Action::Run => {
            apply_config(&args.common, &mut plugins, !plugins_from_args)?;
            collect_once(plugins)
        }
    }
}

/// Starts the enabled plugins, polls each source once and prints what they measured.
fn collect_once(plugins: PluginSet) -> anyhow::Result<()> {
    let mut agent = agent::Builder::new(plugins)
        .build_and_start()
        .context("could not start the plugins")?;
    let measurements = agent.poll_once(Timestamp::now());
    agent.stop();
    log::debug!("collected {} points", measurements.len());

    let stdout = std::io::stdout();
    write_measurements(&mut stdout.lock(), &measurements).context("could not print the measurements")
}

/// Loads the config file, creating it unless `--no-default-config` is set, and hands each
/// section to its plugin.
///
/// With `update_status`, the `enabled` key of each section decides whether the plugin runs.
fn apply_config(args: &CommonArgs, plugins: &mut PluginSet, update_status: bool) -> anyhow::Result<()> {
    let path = Path::new(&args.config);
    let loaded = if args.no_default_config {
        agent::load_config(path, || Err(anyhow!("{} does not exist", path.display())))
    } else {
        agent::load_config(path, || enabled_config(plugins))
    };
    let mut config = loaded.context("could not load the config")?;

    plugins
        .extract_config(&mut config, update_status, UnknownPluginPolicy::Error)
        .context("invalid plugin config")?;
    if !config.is_empty() {
        let keys: Vec<&String> = config.keys().collect();
        log::warn!("ignoring unknown keys in {}: {keys:?}", path.display());
    }
    Ok(())
}

/// The default config, restricted to the enabled plugins.
fn enabled_config(plugins: &PluginSet) -> anyhow::Result<toml::Table> {
    let mut config = plugins.default_config()?;
    if let Some(toml::Value::Table(sections)) = config.get_mut("plugins") {
        sections.retain(|name, _| plugins.is_plugin_enabled(name));
    }
    Ok(config)
}

fn regen_config(path: &str, plugins: &PluginSet) -> anyhow::Result<()> {
    let text = toml::to_string_pretty(&enabled_config(plugins)?)?;
    std::fs::write(path, text).with_context(|| format!("could not write {path}"))?;
    log::info!("wrote the default config to {path}");
    Ok(())
}

fn print_plugins(plugins: &PluginSet, with_status: bool) {
    for p in plugins.metadata() {
        let enabled = with_status.then(|| plugins.is_plugin_enabled(&p.name));
        println!("{}", plugin_line(&p.name, &p.version, enabled));
    }
}

mod cli {
    use clap::{Args, Parser, Subcommand};

    /// Collects illumos metrics once (pools, faults, services, zones, CPU, memory, disks,
    /// network, NFS and SMB) and prints them as line protocol.
    #[derive(Parser)]
    #[command(version)]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Option<Action>,

        #[command(flatten)]
        pub common: CommonArgs,
    }

    #[derive(Subcommand)]
    pub enum Action {
        /// Poll the enabled plugins once and print the points (default).
        Run,

        /// Manage the config file.
        #[command(subcommand)]
        Config(ConfigCommand),

        /// Inspect the built-in plugins.
        #[command(subcommand)]
        Plugins(PluginsCommand),
    }

    #[derive(Subcommand)]
    pub enum ConfigCommand {
        /// Write the default config of the enabled plugins, replacing the file.
        Regen,
    }

    #[derive(Subcommand)]
    pub enum PluginsCommand {
        /// Print the name and version of each plugin.
        List {
            /// Also print whether each plugin is enabled, which requires the config file.
            #[arg(long)]
            status: bool,
        },
    }

    #[derive(Args)]
    pub struct CommonArgs {
        /// Config file, created with the default values if it does not exist.
        #[arg(long, env = "ILLUMOS_AGENT_CONFIG", default_value = "illumos-agent.toml")]
        pub config: String,

        /// Fail if the config file does not exist.
        #[arg(long)]
        pub no_default_config: bool,

        /// Comma-separated plugins to run, like `zpool,smf`. The others are disabled.
        #[arg(long, value_delimiter = ',')]
        pub plugins: Option<Vec<String>>,
    }
}
