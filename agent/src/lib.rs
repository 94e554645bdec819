//! Shared pieces of the illumos agent binary.

use std::io::{self, Write};

use illumos_metrics::{measurement::MeasurementBuffer, plugin::PluginMetadata, static_plugins};

/// Initializes the global logger, with a default level of `info`.
///
/// The level can be changed with the `RUST_LOG` environment variable.
pub fn init_logger() {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env).init();
}

/// Returns the metadata of the collector plugins that are built into the agent.
pub fn load_plugins_metadata() -> Vec<PluginMetadata> {
    static_plugins![
        plugin_cpu::CpuPlugin,
        plugin_disk_health::DiskHealthPlugin,
        plugin_fma::FmaPlugin,
        plugin_io::IoPlugin,
        plugin_memory::MemoryPlugin,
        plugin_network::NetworkPlugin,
        plugin_nfs::NfsPlugin,
        plugin_os::OsPlugin,
        plugin_smb::SmbPlugin,
        plugin_smf::SmfPlugin,
        plugin_zfs_arc::ZfsArcPlugin,
        plugin_zones::ZonesPlugin,
        plugin_zpool::ZpoolPlugin,
    ]
}

/// Formats a line of `plugins list`. The status is printed when it is known.
pub fn plugin_line(name: &str, version: &str, enabled: Option<bool>) -> String {
    match enabled {
        None => format!("{name:<12} {version}"),
        Some(true) => format!("{name:<12} {version:<8} enabled"),
        Some(false) => format!("{name:<12} {version:<8} disabled"),
    }
}

/// Writes each point on its own line.
pub fn write_measurements(out: &mut impl Write, measurements: &MeasurementBuffer) -> io::Result<()> {
    for point in measurements {
        if !point.is_printable() {
            log::debug!("skipping {}: no finite field", point.name);
            continue;
        }
        writeln!(out, "{point}")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use illumos_metrics::measurement::{MeasurementPoint, Timestamp};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn every_plugin_is_built_in() {
        let mut names: Vec<String> = load_plugins_metadata().into_iter().map(|p| p.name).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "cpu",
                "disk-health",
                "fma",
                "io",
                "memory",
                "network",
                "nfs",
                "os",
                "smb",
                "smf",
                "zfs-arc",
                "zones",
                "zpool",
            ]
        );
    }

    #[test]
    fn plugin_lines() {
        assert_eq!(plugin_line("zpool", "0.1.0", None), "zpool        0.1.0");
        assert_eq!(plugin_line("zfs-arc", "0.1.0", Some(false)), "zfs-arc      0.1.0    disabled");
        assert_eq!(plugin_line("disk-health", "0.1.0", Some(true)), "disk-health  0.1.0    enabled");
    }

    #[test]
    fn one_line_per_point() {
        let t = Timestamp::from(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let mut buf = MeasurementBuffer::new();
        buf.push(
            MeasurementPoint::new(t, "smf")
                .with_tag("zone", "global")
                .with_tag("state", "online")
                .with_field("states", 112u64),
        );
        buf.push(MeasurementPoint::new(t, "zfs.arcstats").with_field("size", 2048.5));

        let mut out = Vec::new();
        write_measurements(&mut out, &buf).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "smf,state=online,zone=global states=112u 1700000000000000000\n\
             zfs.arcstats size=2048.5 1700000000000000000\n"
        );
    }

    #[test]
    fn points_without_finite_fields_are_skipped() {
        let t = Timestamp::from(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let mut buf = MeasurementBuffer::new();
        buf.push(MeasurementPoint::new(t, "zfs.arcstats").with_field("ratio", f64::NAN));
        buf.push(
            MeasurementPoint::new(t, "memory.vminfo")
                .with_field("freemem", 4096_u64)
                .with_field("rate", f64::INFINITY),
        );

        let mut out = Vec::new();
        write_measurements(&mut out, &buf).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "memory.vminfo freemem=4096u 1700000000000000000\n"
        );
    }
}
