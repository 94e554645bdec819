//! Extraction of values from free-form command output.
//!
//! `zpool status` and `fmadm faulty` print text meant for humans. The functions of this module
//! look for anchors in that text (a phrase, a `config:` block, a URI) and pull structured
//! values out of what follows them. A missing anchor is not an error: it means that there is
//! nothing to report.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use time::{OffsetDateTime, PrimitiveDateTime, format_description::BorrowedFormatItem, macros::format_description};

use crate::units;

/// Layout of the timestamps printed by `zpool status`, like `Sun Sep 12 15:11:35 2021`.
///
/// Runs of whitespace are collapsed before parsing, so `Tue Feb  2 13:08:42 2010` is accepted.
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short] [month repr:short] [day padding:none] [hour]:[minute]:[second] [year]"
);

static ERROR_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)config:(.*?)errors:").unwrap());

static SWAP_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"total: (\d+k) [\w ]* \+ (\d+k).*= (\d+k) used, (\d+k).*$").unwrap());

/// Finds a timestamp that follows a phrase, like `scrub in progress since`.
#[derive(Debug, Clone)]
pub struct TimestampAnchor {
    regex: Regex,
}

impl TimestampAnchor {
    /// Builds an anchor from a phrase. The phrase is a regular expression, so
    /// `scrub repaired.*errors on` is a valid anchor.
    pub fn new(phrase: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("(?m){phrase} ([^\n]+)"))?;
        Ok(Self { regex })
    }

    /// Returns the raw text that follows the anchor, up to the end of the line.
    pub fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.regex
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim())
    }

    /// Returns the number of seconds between the timestamp that follows the anchor and `now`.
    ///
    /// If the anchor is absent, or if the timestamp cannot be parsed, returns 0.
    pub fn elapsed_seconds(&self, text: &str, now: OffsetDateTime) -> f64 {
        let Some(raw) = self.find(text) else {
            return 0.0;
        };
        match parse_timestamp(raw) {
            Some(then) => (now - then).as_seconds_f64(),
            None => {
                log::debug!("cannot parse timestamp {raw:?}");
                0.0
            }
        }
    }
}

/// Shorthand for building an anchor and calling [`TimestampAnchor::elapsed_seconds`].
pub fn elapsed_since_anchor(text: &str, phrase: &str, now: OffsetDateTime) -> Result<f64, regex::Error> {
    Ok(TimestampAnchor::new(phrase)?.elapsed_seconds(text, now))
}

/// Parses a timestamp like `Sun Sep 12 15:11:35 2021`, as UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    PrimitiveDateTime::parse(&normalized, TIMESTAMP_FORMAT)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Error counters of a device, from the `config:` block of `zpool status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceErrors {
    pub device: String,
    pub state: String,
    pub read: u64,
    pub write: u64,
    pub cksum: u64,
}

/// Extracts the device error counters from the output of `zpool status`.
///
/// The block between `config:` and the next `errors:` is a table whose first line is a header.
/// Pools, vdevs and disks are all returned in document order, without hierarchy.
/// Lines with less than five columns, or with counters that are not integers, are skipped.
pub fn extract_error_block(text: &str) -> Vec<DeviceErrors> {
    let Some(block) = ERROR_BLOCK.captures(text).and_then(|c| c.get(1)) else {
        return Vec::new();
    };

    let mut devices = Vec::new();
    for line in block.as_str().trim().lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            if !fields.is_empty() {
                log::debug!("skipping short line in zpool status config block: {line:?}");
            }
            continue;
        }
        let counters = (fields[2].parse(), fields[3].parse(), fields[4].parse());
        let (Ok(read), Ok(write), Ok(cksum)) = counters else {
            log::warn!("cannot parse the error counts of device {}: {line:?}", fields[0]);
            continue;
        };
        devices.push(DeviceErrors {
            device: fields[0].to_owned(),
            state: fields[1].to_owned(),
            read,
            write,
            cksum,
        });
    }
    devices
}

/// Verbosity of a fault report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReport {
    /// `fmadm faulty`: one `Problem class : fault.x.y` line per suspect.
    Verbose,
    /// `fmadm faulty -arf`: one `scheme://path    status` line per impact.
    Short,
}

/// Returns one classification per fault in the report, in order, with duplicates.
///
/// For a verbose report, this is the problem class (`fault.fs.zfs.vdev.io`).
/// For a short report, this is the status that ends each impact line (`faulted`).
pub fn extract_fault_classes(text: &str, report: FaultReport) -> Vec<String> {
    match report {
        FaultReport::Verbose => text
            .lines()
            .filter(|line| line.contains("Problem class"))
            .filter_map(|line| line.split_once(':'))
            .map(|(_, class)| class.trim().to_owned())
            .filter(|class| !class.is_empty())
            .collect(),
        FaultReport::Short => text
            .lines()
            .filter(|line| line.contains("://"))
            .filter_map(|line| parse_fault_impact(line).and_then(|mut tags| tags.remove("status")))
            .collect(),
    }
}

/// Parses an impact line of `fmadm faulty -arf`, like
/// `zfs://pool=big/vdev=3706b5d93e20f727   faulted`.
///
/// Returns the URI scheme as `module`, every `key=value` component of the path, and the
/// status. Returns `None` if the line is not an impact line.
pub fn parse_fault_impact(line: &str) -> Option<BTreeMap<String, String>> {
    let mut fields = line.split_whitespace();
    let (uri, status) = (fields.next()?, fields.next()?);
    let (module, path) = uri.split_once("://")?;

    let mut tags = BTreeMap::new();
    for component in path.split('/') {
        if let Some((key, value)) = component.split_once('=') {
            tags.insert(key.to_owned(), value.to_owned());
        }
    }
    tags.insert("module".to_owned(), module.to_owned());
    tags.insert("status".to_owned(), status.to_owned());
    Some(tags)
}

/// The summary printed by `swap -s`, in bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapSummary {
    pub allocated: f64,
    pub reserved: f64,
    pub used: f64,
    pub available: f64,
}

/// Parses the output of `swap -s`:
/// `total: 2852796k bytes allocated + 1950828k reserved = 4803624k used, 2638448k available`.
pub fn parse_swap_summary(text: &str) -> Option<SwapSummary> {
    let captures = text.lines().find_map(|line| SWAP_SUMMARY.captures(line))?;
    let size = |i: usize| units::bytify(&captures[i]).ok();
    Some(SwapSummary {
        allocated: size(1)?,
        reserved: size(2)?,
        used: size(3)?,
        available: size(4)?,
    })
}

/// A line of `svcs -H -ozone,state,fmri`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub zone: String,
    pub state: String,
    pub fmri: String,
}

/// Parses a line of `svcs -H -ozone,state,fmri`. The line must have exactly three columns.
pub fn parse_svcs_line(line: &str) -> Option<ServiceState> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [zone, state, fmri] = fields.as_slice() else {
        return None;
    };
    Some(ServiceState {
        zone: (*zone).to_owned(),
        state: (*state).to_owned(),
        fmri: (*fmri).to_owned(),
    })
}

/// Turns a kstat statistic name like `Soft Errors` into a field name like `softErrors`.
///
/// Returns `None` if there is no word in `name`.
pub fn camel_case(name: &str) -> Option<String> {
    let mut words = name.split_whitespace().map(str::to_lowercase);
    let mut camel = words.next()?;
    for word in words {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            camel.extend(first.to_uppercase());
            camel.push_str(chars.as_str());
        }
    }
    Some(camel)
}

/// Parses the `KEY="value"` lines of `/etc/os-release`.
///
/// Keys are lowercased and the double quotes are removed from the values.
/// Lines without `=` are ignored.
pub fn parse_os_release(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.trim().split_once('='))
        .map(|(key, value)| (key.to_lowercase(), value.replace('"', "")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    #[test]
    fn camel_case_names() {
        assert_eq!(camel_case("Soft Errors").as_deref(), Some("softErrors"));
        assert_eq!(camel_case("word").as_deref(), Some("word"));
        assert_eq!(camel_case("One tWO three").as_deref(), Some("oneTwoThree"));
        assert_eq!(camel_case("  Serial   No ").as_deref(), Some("serialNo"));
        assert_eq!(camel_case(""), None);
        assert_eq!(camel_case("   "), None);
    }

    #[test]
    fn os_release() {
        let text = "NAME=\"OmniOS\"\nPRETTY_NAME=\"OmniOS Community Edition v11 r151046l\"\n\nVERSION=r151046\nBUILD_ID=151046.12.2023.06.02\n";
        let release = parse_os_release(text);
        assert_eq!(release["name"], "OmniOS");
        assert_eq!(release["version"], "r151046");
        assert_eq!(release["build_id"], "151046.12.2023.06.02");
        assert_eq!(release["pretty_name"], "OmniOS Community Edition v11 r151046l");
        assert_eq!(release.len(), 4);
    }

    const RESILVERING: &str = "  pool: big
 state: ONLINE
status: One or more devices is currently being resilvered.  The pool will
        continue to function, possibly in a degraded state.
action: Wait for the resilver to complete.
  scan: resilver in progress since Sun Sep 12 15:11:35 2021
        243M scanned at 20.2M/s, 344K issued at 28.7K/s, 2.56T total
        0 resilvered, 0.00% done, no estimated completion time
config:

        NAME        STATE     READ WRITE CKSUM
        big         ONLINE       0     0     0
          mirror-0  ONLINE       0     0     0
            c2t0d0  ONLINE       0     0     0
            c2t1d0  ONLINE       0     0     0

errors: No known data errors
";

    const SCRUBBED: &str = "    pool: rpool
 state: ONLINE
  scan: scrub repaired 0 in 0 days 00:03:10 with 0 errors on Fri Feb 19 17:09:54 2021
config:

        NAME          STATE     READ WRITE CKSUM
        rpool         ONLINE       0     0     0
          mirror-0    ONLINE       0     0     0
            c2t2d0s1  ONLINE       0     0     0
            c2t3d0s1  ONLINE       0     0     0

errors: No known data errors
";

    const FAULTED: &str = "  pool: tank
 state: UNAVAIL
status: One or more devices are faulted in response to IO failures.
action: Make sure the affected devices are connected, then run 'zpool clear'.
   see: http://www.sun.com/msg/ZFS-8000-HC
 scrub: scrub completed after 0h0m with 0 errors on Tue Feb  2 13:08:42 2010
config:

        NAME        STATE     READ WRITE CKSUM
        tank        UNAVAIL      0     0     0  insufficient replicas
          c1t0d0    ONLINE       0     0     0
          c1t1d0    UNAVAIL      4     1     0  cannot open
          c1t2d0    REMOVED      -     -     -

errors: Permanent errors have been detected in the following files:

/tank/data/aaa
";

    #[test]
    fn timestamps() {
        assert_eq!(parse_timestamp("Sun Sep 12 15:11:35 2021"), Some(datetime!(2021-09-12 15:11:35 UTC)));
        assert_eq!(parse_timestamp("Tue Feb  2 13:08:42 2010"), Some(datetime!(2010-02-02 13:08:42 UTC)));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2021-09-12 15:11:35"), None);
    }

    #[test]
    fn resilver_time() {
        let now = datetime!(2021-09-12 17:00:00 UTC);
        let anchor = TimestampAnchor::new("resilver in progress since").unwrap();
        assert_eq!(anchor.elapsed_seconds(RESILVERING, now), 6505.0);
        assert_eq!(anchor.elapsed_seconds(SCRUBBED, now), 0.0);
    }

    #[test]
    fn pattern_anchor() {
        let now = datetime!(2021-02-19 17:10:04 UTC);
        assert_eq!(elapsed_since_anchor(SCRUBBED, "scrub repaired.*errors on", now), Ok(10.0));
        assert_eq!(elapsed_since_anchor(RESILVERING, "scrub repaired.*errors on", now), Ok(0.0));
        assert!(elapsed_since_anchor(SCRUBBED, "scrub (", now).is_err());
    }

    #[test]
    fn unparseable_timestamp_is_zero() {
        let text = "scan: scrub in progress since the dawn of time";
        let now = datetime!(2021-02-19 17:10:04 UTC);
        assert_eq!(elapsed_since_anchor(text, "scrub in progress since", now), Ok(0.0));
    }

    #[test]
    fn error_block() {
        let devices = extract_error_block(SCRUBBED);
        let names: Vec<&str> = devices.iter().map(|d| d.device.as_str()).collect();
        assert_eq!(names, vec!["rpool", "mirror-0", "c2t2d0s1", "c2t3d0s1"]);
        assert!(devices.iter().all(|d| d.state == "ONLINE" && d.read + d.write + d.cksum == 0));
    }

    #[test]
    fn error_block_with_errors_and_bad_counters() {
        assert_eq!(
            extract_error_block(FAULTED),
            vec![
                DeviceErrors {
                    device: "tank".to_owned(),
                    state: "UNAVAIL".to_owned(),
                    read: 0,
                    write: 0,
                    cksum: 0,
                },
                DeviceErrors {
                    device: "c1t0d0".to_owned(),
                    state: "ONLINE".to_owned(),
                    read: 0,
                    write: 0,
                    cksum: 0,
                },
                DeviceErrors {
                    device: "c1t1d0".to_owned(),
                    state: "UNAVAIL".to_owned(),
                    read: 4,
                    write: 1,
                    cksum: 0,
                },
            ]
        );
    }

    #[test]
    fn no_error_block() {
        assert!(extract_error_block("pool: x\nstate: ONLINE\n").is_empty());
        assert!(extract_error_block("config:\n NAME STATE READ WRITE CKSUM\n").is_empty());
    }

    #[test]
    fn verbose_fault_classes() {
        let text = "Suspect 1 of 2 :
   Problem class : fault.fs.zfs.vdev.io
   Affects     : zfs://pool=18f02750861aa19d/vdev=f2872c88967c8b56
     FMRI             : \"zfs://pool=18f02750861aa19d/vdev=f2872c88967c8b56\"
Suspect 2 of 2 :
   Problem class : fault.fs.zfs.vdev.probe_failure
   Problem class : fault.fs.zfs.vdev.io
";
        assert_eq!(
            extract_fault_classes(text, FaultReport::Verbose),
            vec![
                "fault.fs.zfs.vdev.io",
                "fault.fs.zfs.vdev.probe_failure",
                "fault.fs.zfs.vdev.io"
            ]
        );
    }

    #[test]
    fn short_fault_classes() {
        let text = "zfs://pool=big/vdev=3706b5d93e20f727                                  faulted
mem:///motherboard=0/chip=0/memory-controller=0/dimm=0/rank=0       faulty
nothing to see here";
        assert_eq!(extract_fault_classes(text, FaultReport::Short), vec!["faulted", "faulty"]);
        assert!(extract_fault_classes("", FaultReport::Short).is_empty());
    }

    #[test]
    fn fault_impact() {
        let tags = parse_fault_impact("mem:///motherboard=0/chip=0/memory-controller=0/dimm=0/rank=0       faulty");
        let expected: BTreeMap<String, String> = [
            ("module", "mem"),
            ("motherboard", "0"),
            ("chip", "0"),
            ("memory-controller", "0"),
            ("dimm", "0"),
            ("rank", "0"),
            ("status", "faulty"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        assert_eq!(tags, Some(expected));
        assert_eq!(parse_fault_impact("zfs://pool=big"), None);
        assert_eq!(parse_fault_impact("no uri here"), None);
    }

    #[test]
    fn swap_summary() {
        let line = "total: 2852796k bytes allocated + 1950828k reserved = 4803624k used, 2638448k available";
        assert_eq!(
            parse_swap_summary(line),
            Some(SwapSummary {
                allocated: 2_852_796.0 * 1024.0,
                reserved: 1_950_828.0 * 1024.0,
                used: 4_803_624.0 * 1024.0,
                available: 2_638_448.0 * 1024.0,
            })
        );
        assert_eq!(parse_swap_summary("swap: command not found"), None);
    }

    #[test]
    fn svcs_lines() {
        assert_eq!(
            parse_svcs_line("serv-wf          online         svc:/network/initial:default"),
            Some(ServiceState {
                zone: "serv-wf".to_owned(),
                state: "online".to_owned(),
                fmri: "svc:/network/initial:default".to_owned(),
            })
        );
        assert_eq!(parse_svcs_line("global online"), None);
        assert_eq!(parse_svcs_line("global online svc:/a:default extra"), None);
    }
}
