//! Virtual and physical memory usage: swap, kernel memory, vminfo, per-CPU paging and zone memory caps.

use anyhow::Context;
use illumos_metrics::plugin::{CollectorPlugin, ConfigTable, PluginStart, deserialize_config, serialize_config};
use serde::{Deserialize, Serialize};

mod kstats;
mod swap;
mod sysconf;

pub use kstats::{CpuVmSource, ExtraSource, VminfoSource, ZoneMemcapSource};
pub use sysconf::page_size;
pub use swap::SwapSource;

pub struct MemoryPlugin {
    config: Config,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Report the output of `swap -s`.
    pub swap_on: bool,
    /// Among `allocated`, `reserved`, `used` and `available`. Empty means all of them.
    pub swap_fields: Vec<String>,

    /// Report the memory used by the kernel, the free list and the ZFS ARC.
    pub extra_on: bool,
    /// Among `kernel`, `freelist` and `arcsize`. Empty means all of them.
    pub extra_fields: Vec<String>,
    /// Overrides the size of a memory page, in bytes. By default, it is queried from the system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u64>,

    /// Report the `unix:0:vminfo` counters, converted from pages to bytes.
    pub vminfo_on: bool,
    /// Among `freemem`, `swap_alloc`, `swap_avail`, `swap_free` and `swap_resv`.
    pub vminfo_fields: Vec<String>,

    /// Report the paging statistics of each CPU.
    pub cpuvm_on: bool,
    pub cpuvm_fields: Vec<String>,
    /// Sum the statistics of every CPU instead of reporting them one by one.
    pub cpuvm_aggregate: bool,

    /// Report the memory caps of the zones.
    pub zone_memcap_on: bool,
    pub zone_memcap_zones: Vec<String>,
    pub zone_memcap_fields: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let fields = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        Self {
            swap_on: true,
            swap_fields: fields(&["allocated", "reserved", "used", "available"]),
            extra_on: true,
            extra_fields: fields(&["kernel", "arcsize", "freelist"]),
            page_size: None,
            vminfo_on: true,
            vminfo_fields: fields(&["freemem", "swap_alloc", "swap_avail", "swap_free", "swap_resv"]),
            cpuvm_on: false,
            cpuvm_fields: fields(&["pgin", "anonpgin", "pgpgin", "pgout", "anonpgout", "pgpgout"]),
            cpuvm_aggregate: false,
            zone_memcap_on: true,
            zone_memcap_zones: Vec::new(),
            zone_memcap_fields: fields(&["physcap", "rss", "swap"]),
        }
    }
}

impl CollectorPlugin for MemoryPlugin {
    fn name() -> &'static str {
        "memory"
    }

    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn default_config() -> anyhow::Result<Option<ConfigTable>> {
        Ok(Some(serialize_config(Config::default())?))
    }

    fn init(config: ConfigTable) -> anyhow::Result<Box<Self>> {
        let config: Config = deserialize_config(config)?;
        if config.page_size == Some(0) {
            anyhow::bail!("invalid config: page_size cannot be zero");
        }
        Ok(Box::new(MemoryPlugin { config }))
    }

    fn start(&mut self, start: &mut PluginStart) -> anyhow::Result<()> {
        let c = &self.config;
        let page_size = match c.page_size {
            Some(size) => size,
            None => page_size().context("could not get the page size")?,
        };
        log::debug!("memory pages are {page_size} bytes");
        if c.swap_on {
            let source = SwapSource::new(c.swap_fields.clone(), start.command_runner());
            start.add_source("swap", Box::new(source))?;
        }
        if c.extra_on {
            let source = ExtraSource::new(c.extra_fields.clone(), page_size, start.kstat_reader());
            start.add_source("extra", Box::new(source))?;
        }
        if c.vminfo_on {
            let source = VminfoSource::new(c.vminfo_fields.clone(), page_size, start.kstat_reader());
            start.add_source("vminfo", Box::new(source))?;
        }
        if c.cpuvm_on {
            let source = CpuVmSource::new(c.cpuvm_fields.clone(), c.cpuvm_aggregate, start.kstat_reader());
            start.add_source("cpu_vm", Box::new(source))?;
        }
        if c.zone_memcap_on {
            let source = ZoneMemcapSource::new(
                c.zone_memcap_zones.clone(),
                c.zone_memcap_fields.clone(),
                start.kstat_reader(),
            );
            start.add_source("zone_memcap", Box::new(source))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
