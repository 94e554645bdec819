//! Access to the illumos kernel statistics.
//!
//! A kstat is identified by `module:instance:name`, and holds named statistics.
//! The collectors read them through a [`KstatReader`], so that they can be tested
//! without a kernel. On illumos, [`system_reader`] returns a reader that talks to libkstat
//! directly. Elsewhere it falls back to [`CommandKstatReader`], which parses the output of
//! `kstat -p`.
//!
//! Both readers expose the same statistics: the named values of the kstat, plus
//! `class`, `crtime` and `snaptime` like `kstat -p` prints them.

use std::{collections::BTreeMap, fmt, sync::Arc};

use anyhow::Context;
use thiserror::Error;

use crate::command::{CommandRunner, command_line};

pub const KSTAT_BINARY: &str = "/usr/bin/kstat";

/// Value of a named statistic.
#[derive(Debug, Clone, PartialEq)]
pub enum KstatValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
}

impl KstatValue {
    /// Parses the textual representation of a value, trying the most precise type first.
    pub fn parse(raw: &str) -> Self {
        if let Ok(v) = raw.parse() {
            KstatValue::Uint(v)
        } else if let Ok(v) = raw.parse() {
            KstatValue::Int(v)
        } else if let Ok(v) = raw.parse() {
            KstatValue::Float(v)
        } else {
            KstatValue::Str(raw.to_owned())
        }
    }

    /// Returns the value as a float, or `None` if it is a string.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KstatValue::Int(v) => Some(*v as f64),
            KstatValue::Uint(v) => Some(*v as f64),
            KstatValue::Float(v) => Some(*v),
            KstatValue::Str(_) => None,
        }
    }
}

impl fmt::Display for KstatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KstatValue::Int(v) => write!(f, "{v}"),
            KstatValue::Uint(v) => write!(f, "{v}"),
            KstatValue::Float(v) => write!(f, "{v}"),
            KstatValue::Str(v) => f.write_str(v.trim()),
        }
    }
}

impl From<u64> for KstatValue {
    fn from(value: u64) -> Self {
        KstatValue::Uint(value)
    }
}

impl From<i64> for KstatValue {
    fn from(value: i64) -> Self {
        KstatValue::Int(value)
    }
}

impl From<f64> for KstatValue {
    fn from(value: f64) -> Self {
        KstatValue::Float(value)
    }
}

impl From<&str> for KstatValue {
    fn from(value: &str) -> Self {
        KstatValue::Str(value.to_owned())
    }
}

/// A single statistic of a kstat.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedStat {
    pub module: String,
    pub instance: i32,
    /// Name of the kstat, not of the statistic. For `zones:3:web:boot_time`, this is `web`.
    pub name: String,
    pub statistic: String,
    pub value: KstatValue,
}

/// Identifies the kstat that a statistic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KstatKey<'a> {
    pub module: &'a str,
    pub instance: i32,
    pub name: &'a str,
}

impl NamedStat {
    pub fn key(&self) -> KstatKey<'_> {
        KstatKey {
            module: &self.module,
            instance: self.instance,
            name: &self.name,
        }
    }
}

/// Groups statistics by kstat, ordered by module, instance and name.
pub fn group_by_kstat(stats: &[NamedStat]) -> BTreeMap<KstatKey<'_>, Vec<&NamedStat>> {
    let mut groups: BTreeMap<KstatKey<'_>, Vec<&NamedStat>> = BTreeMap::new();
    for stat in stats {
        groups.entry(stat.key()).or_default().push(stat);
    }
    groups
}

/// Selects statistics. Unset parts match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KstatSelector {
    pub module: Option<String>,
    pub instance: Option<i32>,
    pub name: Option<String>,
    pub statistic: Option<String>,
    /// Class of the kstat, like `disk` or `device_error`.
    ///
    /// The class is a property of the kstat, not of its statistics: [`KstatSelector::matches`]
    /// ignores it and the readers apply it when they enumerate the kstats.
    pub class: Option<String>,
}

impl KstatSelector {
    /// Selects every statistic of a module.
    pub fn module(module: &str) -> Self {
        Self {
            module: Some(module.to_owned()),
            ..Default::default()
        }
    }

    pub fn instance(mut self, instance: i32) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn statistic(mut self, statistic: &str) -> Self {
        self.statistic = Some(statistic.to_owned());
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.class = Some(class.to_owned());
        self
    }

    pub fn matches(&self, stat: &NamedStat) -> bool {
        self.module.as_ref().is_none_or(|m| *m == stat.module)
            && self.instance.is_none_or(|i| i == stat.instance)
            && self.name.as_ref().is_none_or(|n| *n == stat.name)
            && self.statistic.as_ref().is_none_or(|s| *s == stat.statistic)
    }

    /// Formats the selector as a `kstat -p` argument: `module:instance:name:statistic`,
    /// with empty parts for wildcards.
    pub fn to_pattern(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.module.as_deref().unwrap_or_default(),
            self.instance.map(|i| i.to_string()).unwrap_or_default(),
            self.name.as_deref().unwrap_or_default(),
            self.statistic.as_deref().unwrap_or_default()
        )
    }
}

impl fmt::Display for KstatSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pattern())?;
        if let Some(class) = &self.class {
            write!(f, " (class {class})")?;
        }
        Ok(())
    }
}

/// Identity of a kstat, as found in the kstat chain.
#[derive(Debug, Clone, Copy)]
pub struct KstatHeader<'a> {
    pub module: &'a str,
    pub instance: i32,
    pub name: &'a str,
    pub class: &'a str,
    /// Creation time, in nanoseconds since boot.
    pub crtime: i64,
    /// Time of the last snapshot, in nanoseconds since boot.
    pub snaptime: i64,
}

impl KstatHeader<'_> {
    pub fn stat(&self, statistic: &str, value: KstatValue) -> NamedStat {
        NamedStat {
            module: self.module.to_owned(),
            instance: self.instance,
            name: self.name.to_owned(),
            statistic: statistic.to_owned(),
            value,
        }
    }

    /// The statistics that every kstat has, named like in `kstat -p`.
    pub fn common_stats(&self) -> [NamedStat; 3] {
        [
            self.stat("class", KstatValue::Str(self.class.to_owned())),
            self.stat("crtime", KstatValue::Float(hrtime_secs(self.crtime))),
            self.stat("snaptime", KstatValue::Float(hrtime_secs(self.snaptime))),
        ]
    }
}

/// Converts a high-resolution time to seconds.
pub fn hrtime_secs(nanos: i64) -> f64 {
    nanos as f64 / 1e9
}

/// Converts a `KSTAT_DATA_CHAR` value, which is padded with NUL bytes.
pub fn char_value(bytes: &[u8]) -> KstatValue {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    KstatValue::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// The I/O counters of a `KSTAT_TYPE_IO` kstat, named like in `kstat -p`.
///
/// The times are kept in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub nread: u64,
    pub nwritten: u64,
    pub reads: u32,
    pub writes: u32,
    pub wtime: i64,
    pub wlentime: i64,
    pub wlastupdate: i64,
    pub rtime: i64,
    pub rlentime: i64,
    pub rlastupdate: i64,
    pub wcnt: u32,
    pub rcnt: u32,
}

impl IoCounters {
    pub fn values(&self) -> [(&'static str, KstatValue); 12] {
        [
            ("nread", KstatValue::Uint(self.nread)),
            ("nwritten", KstatValue::Uint(self.nwritten)),
            ("reads", KstatValue::Uint(self.reads.into())),
            ("writes", KstatValue::Uint(self.writes.into())),
            ("wtime", KstatValue::Int(self.wtime)),
            ("wlentime", KstatValue::Int(self.wlentime)),
            ("wlastupdate", KstatValue::Int(self.wlastupdate)),
            ("rtime", KstatValue::Int(self.rtime)),
            ("rlentime", KstatValue::Int(self.rlentime)),
            ("rlastupdate", KstatValue::Int(self.rlastupdate)),
            ("wcnt", KstatValue::Uint(self.wcnt.into())),
            ("rcnt", KstatValue::Uint(self.rcnt.into())),
        ]
    }
}

/// Reads kernel statistics.
pub trait KstatReader: Send + Sync {
    /// Returns the statistics that match the selector, in no particular order.
    /// An empty result is not an error.
    fn read(&self, selector: &KstatSelector) -> anyhow::Result<Vec<NamedStat>>;

    /// Returns the value of a single statistic.
    fn read_one(&self, selector: &KstatSelector) -> anyhow::Result<Option<KstatValue>> {
        Ok(self.read(selector)?.into_iter().next().map(|s| s.value))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KstatParseError {
    #[error("missing tab between the statistic and its value")]
    MissingValue,
    #[error("expected module:instance:name:statistic, got {0:?}")]
    InvalidKey(String),
    #[error("invalid instance number {0:?}")]
    InvalidInstance(String),
}

/// Parses one line of `kstat -p`, like `zfs:0:arcstats:size\t123456`.
///
/// The name of a kstat can contain colons, the statistic cannot.
pub fn parse_kstat_line(line: &str) -> Result<NamedStat, KstatParseError> {
    let (key, value) = line.split_once('\t').ok_or(KstatParseError::MissingValue)?;
    let (prefix, statistic) = key
        .rsplit_once(':')
        .ok_or_else(|| KstatParseError::InvalidKey(key.to_owned()))?;
    let mut parts = prefix.splitn(3, ':');
    let (Some(module), Some(instance), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(KstatParseError::InvalidKey(key.to_owned()));
    };
    let instance = instance
        .parse()
        .map_err(|_| KstatParseError::InvalidInstance(instance.to_owned()))?;
    Ok(NamedStat {
        module: module.to_owned(),
        instance,
        name: name.to_owned(),
        statistic: statistic.to_owned(),
        value: KstatValue::parse(value.trim()),
    })
}

/// Parses the whole output of `kstat -p`. Lines that cannot be parsed are skipped.
pub fn parse_kstat_p(raw: &str) -> Vec<NamedStat> {
    raw.lines()
        .filter(|l| !l.is_empty())
        .filter_map(|line| match parse_kstat_line(line) {
            Ok(stat) => Some(stat),
            Err(e) => {
                log::trace!("skipping kstat line {line:?}: {e}");
                None
            }
        })
        .collect()
}

/// Reads kstats by running `kstat -p`.
pub struct CommandKstatReader {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl CommandKstatReader {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: KSTAT_BINARY.to_owned(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

impl KstatReader for CommandKstatReader {
    fn read(&self, selector: &KstatSelector) -> anyhow::Result<Vec<NamedStat>> {
        let pattern = selector.to_pattern();
        let mut args = Vec::with_capacity(4);
        if let Some(class) = &selector.class {
            args.extend(["-c", class.as_str()]);
        }
        args.extend(["-p", pattern.as_str()]);
        let output = self.runner.run(&self.binary, &args)?;
        // kstat exits with 1 when nothing matches
        if !output.success() && !output.stderr.is_empty() {
            anyhow::bail!("{} failed: {}", command_line(&self.binary, &args), output.stderr);
        }
        let stats = parse_kstat_p(&output.stdout)
            .into_iter()
            .filter(|s| selector.matches(s))
            .collect();
        Ok(stats)
    }
}

#[cfg(target_os = "illumos")]
pub use libkstat::LibKstatReader;

/// Returns the reader to use on this system.
///
/// The runner is only used where libkstat is not available.
#[cfg(target_os = "illumos")]
pub fn system_reader(_runner: Arc<dyn CommandRunner>) -> Arc<dyn KstatReader> {
    Arc::new(LibKstatReader)
}

/// Returns the reader to use on this system.
///
/// The runner is only used where libkstat is not available.
#[cfg(not(target_os = "illumos"))]
pub fn system_reader(runner: Arc<dyn CommandRunner>) -> Arc<dyn KstatReader> {
    Arc::new(CommandKstatReader::new(runner))
}

#[cfg(target_os = "illumos")]
mod libkstat {
    use anyhow::Context;
    use kstat_rs::{Ctl, Data, NamedData};

    use super::{IoCounters, KstatHeader, KstatReader, KstatSelector, KstatValue, NamedStat, char_value};

    /// Reads kstats through libkstat.
    pub struct LibKstatReader;

    fn named_value(value: &NamedData<'_>) -> KstatValue {
        match value {
            NamedData::Char(bytes) => char_value(bytes),
            NamedData::Int32(v) => KstatValue::Int((*v).into()),
            NamedData::UInt32(v) => KstatValue::Uint((*v).into()),
            NamedData::Int64(v) => KstatValue::Int(*v),
            NamedData::UInt64(v) => KstatValue::Uint(*v),
            NamedData::String(s) => KstatValue::Str((*s).to_owned()),
        }
    }

    impl KstatReader for LibKstatReader {
        fn read(&self, selector: &KstatSelector) -> anyhow::Result<Vec<NamedStat>> {
            // a Ctl cannot move between threads, every read opens its own
            let ctl = Ctl::new().context("could not open the kstat device")?;
            let mut stats = Vec::new();
            let kstats = ctl.filter(selector.module.as_deref(), selector.instance, selector.name.as_deref());
            for mut kstat in kstats {
                if selector.class.as_deref().is_some_and(|c| c != kstat.ks_class) {
                    continue;
                }
                let header = KstatHeader {
                    module: kstat.ks_module,
                    instance: kstat.ks_instance,
                    name: kstat.ks_name,
                    class: kstat.ks_class,
                    crtime: kstat.ks_crtime,
                    snaptime: kstat.ks_snaptime,
                };
                let data = match ctl.read(&mut kstat) {
                    Ok(data) => data,
                    Err(e) => {
                        // the kstat can disappear between the lookup and the read
                        log::debug!("could not read kstat {}:{}:{}: {e}", header.module, header.instance, header.name);
                        continue;
                    }
                };
                // snaptime is only known after the read
                let header = KstatHeader {
                    snaptime: kstat.ks_snaptime,
                    ..header
                };
                stats.extend(header.common_stats());
                match data {
                    Data::Named(named) => {
                        stats.extend(named.iter().map(|n| header.stat(n.name, named_value(&n.value))));
                    }
                    Data::Io(io) => {
                        let counters = IoCounters {
                            nread: io.nread,
                            nwritten: io.nwritten,
                            reads: io.reads,
                            writes: io.writes,
                            wtime: io.wtime,
                            wlentime: io.wlentime,
                            wlastupdate: io.wlastupdate,
                            rtime: io.rtime,
                            rlentime: io.rlentime,
                            rlastupdate: io.rlastupdate,
                            wcnt: io.wcnt,
                            rcnt: io.rcnt,
                        };
                        stats.extend(counters.values().into_iter().map(|(s, v)| header.stat(s, v)));
                    }
                    // raw, interrupt and timer kstats are not collected
                    _ => (),
                }
            }
            stats.retain(|s| selector.matches(s));
            Ok(stats)
        }
    }
}

/// Reads the statistics of a selector, with context on failure.
pub fn read_stats(reader: &dyn KstatReader, selector: &KstatSelector) -> anyhow::Result<Vec<NamedStat>> {
    reader
        .read(selector)
        .with_context(|| format!("could not read kstats {selector}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use pretty_assertions::assert_eq;

    const KSTAT_OUTPUT: &str = "zfs:0:arcstats:c\t4294967296
zfs:0:arcstats:crtime\t31.415926
zfs:0:arcstats:size\t3221225472
zones:3:cube-media:boot_time\t1631459495
zones:3:cube-media:zonename\tcube-media
link:0:dns_net0:obytes64\t123
unix:0:system_pages:pp_kernel\t-1
broken line
a:b:c:d\t1";

    struct Fixed(&'static str);

    impl CommandRunner for Fixed {
        fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<CommandOutput> {
            assert_eq!(command_line(program, args), "/usr/bin/kstat -p zfs:0:arcstats:");
            Ok(CommandOutput::ok(self.0))
        }
    }

    #[test]
    fn parse_output() {
        let stats = parse_kstat_p(KSTAT_OUTPUT);
        assert_eq!(stats.len(), 7);
        assert_eq!(
            stats[1],
            NamedStat {
                module: "zfs".to_owned(),
                instance: 0,
                name: "arcstats".to_owned(),
                statistic: "crtime".to_owned(),
                value: KstatValue::Float(31.415926),
            }
        );
        assert_eq!(stats[4].value, KstatValue::Str("cube-media".to_owned()));
        assert_eq!(stats[6].value, KstatValue::Int(-1));
        assert_eq!(stats[3].value.as_f64(), Some(1631459495.0));
    }

    #[test]
    fn grouped_by_kstat() {
        let stats = parse_kstat_p(KSTAT_OUTPUT);
        let groups = group_by_kstat(&stats);
        let keys: Vec<String> = groups
            .keys()
            .map(|k| format!("{}:{}:{}", k.module, k.instance, k.name))
            .collect();
        assert_eq!(
            keys,
            vec!["link:0:dns_net0", "unix:0:system_pages", "zfs:0:arcstats", "zones:3:cube-media"]
        );
        let arc = &groups[&KstatKey {
            module: "zfs",
            instance: 0,
            name: "arcstats",
        }];
        assert_eq!(arc.len(), 3);
    }

    #[test]
    fn display_values() {
        assert_eq!(KstatValue::Int(-2).to_string(), "-2");
        assert_eq!(KstatValue::Uint(2400).to_string(), "2400");
        assert_eq!(KstatValue::Float(0.5).to_string(), "0.5");
        assert_eq!(KstatValue::Str("on-line  ".to_owned()).to_string(), "on-line");
    }

    #[test]
    fn parse_errors() {
        assert_eq!(parse_kstat_line("x"), Err(KstatParseError::MissingValue));
        assert_eq!(
            parse_kstat_line("a:b\t1"),
            Err(KstatParseError::InvalidKey("a:b".to_owned()))
        );
        assert_eq!(
            parse_kstat_line("a:b:c:d\t1"),
            Err(KstatParseError::InvalidInstance("b".to_owned()))
        );
    }

    #[test]
    fn name_with_colons() {
        let stat = parse_kstat_line("sd:0:sd0,err:Hard Errors\t0").unwrap();
        assert_eq!(stat.name, "sd0,err");
        assert_eq!(stat.statistic, "Hard Errors");
        let stat = parse_kstat_line("mod:1:a:b:c\t0").unwrap();
        assert_eq!(stat.name, "a:b");
        assert_eq!(stat.statistic, "c");
    }

    #[test]
    fn selectors() {
        let all = parse_kstat_p(KSTAT_OUTPUT);
        let sel = KstatSelector::module("zones").statistic("boot_time");
        assert_eq!(sel.to_pattern(), "zones:::boot_time");
        let selected: Vec<_> = all.iter().filter(|s| sel.matches(s)).collect();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "cube-media");
        assert_eq!(KstatSelector::default().to_pattern(), ":::");
        assert_eq!(KstatSelector::module("zfs").instance(0).name("arcstats").to_string(), "zfs:0:arcstats:");
    }

    struct ClassRunner;

    impl CommandRunner for ClassRunner {
        fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<CommandOutput> {
            assert_eq!(command_line(program, args), "/usr/bin/kstat -c disk -p :::");
            Ok(CommandOutput::ok("sd:0:sd0:class\tdisk\nsd:0:sd0:reads\t12"))
        }
    }

    #[test]
    fn command_reader_with_class() {
        let reader = CommandKstatReader::new(Arc::new(ClassRunner));
        let sel = KstatSelector::default().class("disk");
        assert_eq!(sel.to_string(), "::: (class disk)");
        let stats = reader.read(&sel).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].value, KstatValue::Uint(12));
    }

    #[test]
    fn header_stats_like_kstat_p() {
        let header = KstatHeader {
            module: "sd",
            instance: 6,
            name: "sd6",
            class: "disk",
            crtime: 31_415_926_000,
            snaptime: 1_500_000_000,
        };
        let [class, crtime, snaptime] = header.common_stats();
        assert_eq!(class.value, KstatValue::Str("disk".to_owned()));
        assert_eq!((class.module.as_str(), class.instance, class.name.as_str()), ("sd", 6, "sd6"));
        assert_eq!(crtime.statistic, "crtime");
        assert_eq!(crtime.value, KstatValue::Float(31.415926));
        assert_eq!(snaptime.value, KstatValue::Float(1.5));
    }

    #[test]
    fn io_counters() {
        let io = IoCounters {
            nread: 1024,
            reads: 3,
            writes: 4,
            rlastupdate: 99,
            ..Default::default()
        };
        let values = io.values();
        assert_eq!(values.len(), 12);
        assert_eq!(values[0], ("nread", KstatValue::Uint(1024)));
        assert_eq!(values[2], ("reads", KstatValue::Uint(3)));
        assert_eq!(values[3], ("writes", KstatValue::Uint(4)));
        assert_eq!(values[9], ("rlastupdate", KstatValue::Int(99)));
    }

    #[test]
    fn char_values() {
        assert_eq!(char_value(b"ATA\0\0\0\0\0"), KstatValue::Str("ATA".to_owned()));
        assert_eq!(char_value(b"full"), KstatValue::Str("full".to_owned()));
    }

    #[test]
    fn command_reader() {
        let reader = CommandKstatReader::new(Arc::new(Fixed(KSTAT_OUTPUT)));
        let sel = KstatSelector::module("zfs").instance(0).name("arcstats");
        let stats = reader.read(&sel).unwrap();
        let names: Vec<&str> = stats.iter().map(|s| s.statistic.as_str()).collect();
        assert_eq!(names, vec!["c", "crtime", "size"]);
    }
}
