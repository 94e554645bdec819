use std::{collections::BTreeMap, sync::Arc};

use illumos_metrics::{
    filter::{want, want_field},
    kstat::{KstatReader, KstatSelector, NamedStat, read_stats},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    source::{PollError, Retryable, Source},
};

/// An extra field: where to read it, and whether it is a number of pages.
struct Extra {
    field: &'static str,
    name: &'static str,
    statistic: &'static str,
    module: &'static str,
    in_pages: bool,
}

const EXTRAS: [Extra; 3] = [
    Extra {
        field: "kernel",
        module: "unix",
        name: "system_pages",
        statistic: "pp_kernel",
        in_pages: true,
    },
    Extra {
        field: "freelist",
        module: "unix",
        name: "system_pages",
        statistic: "pagesfree",
        in_pages: true,
    },
    Extra {
        field: "arcsize",
        module: "zfs",
        name: "arcstats",
        statistic: "size",
        in_pages: false,
    },
];

/// Reports the memory used by the kernel and by the ZFS ARC, and the size of the free list.
pub struct ExtraSource {
    fields: Vec<String>,
    page_size: u64,
    kstat: Arc<dyn KstatReader>,
}

impl ExtraSource {
    pub fn new(fields: Vec<String>, page_size: u64, kstat: Arc<dyn KstatReader>) -> Self {
        Self {
            fields,
            page_size,
            kstat,
        }
    }
}

impl Source for ExtraSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let mut point = MeasurementPoint::new(timestamp, "memory");
        for extra in EXTRAS.iter().filter(|e| want_field(e.field, &self.fields)) {
            let selector = KstatSelector::module(extra.module)
                .instance(0)
                .name(extra.name)
                .statistic(extra.statistic);
            // one missing statistic does not prevent reading the others
            let value = match self.kstat.read_one(&selector) {
                Ok(value) => value.and_then(|v| v.as_f64()),
                Err(e) => {
                    log::warn!("could not read {selector}: {e:#}");
                    None
                }
            };
            match value {
                Some(v) if extra.in_pages => point.add_field(extra.field, v * self.page_size as f64),
                Some(v) => point.add_field(extra.field, v),
                None => log::debug!("no value for {}", extra.field),
            }
        }
        acc.push(point);
        Ok(())
    }
}

/// The vminfo statistics, with the field they are reported as.
const VMINFO: [(&str, &str); 5] = [
    ("freemem", "freemem"),
    ("swap_alloc", "swapAlloc"),
    ("swap_avail", "swapAvail"),
    ("swap_free", "swapFree"),
    ("swap_resv", "swapResv"),
];

/// Reports the `unix:0:vminfo` counters, in bytes.
///
/// The kernel adds the current number of pages to these counters once per second,
/// so they only make sense as rates.
pub struct VminfoSource {
    fields: Vec<String>,
    page_size: u64,
    kstat: Arc<dyn KstatReader>,
}

impl VminfoSource {
    pub fn new(fields: Vec<String>, page_size: u64, kstat: Arc<dyn KstatReader>) -> Self {
        Self {
            fields,
            page_size,
            kstat,
        }
    }
}

impl Source for VminfoSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let selector = KstatSelector::module("unix").instance(0).name("vminfo");
        let stats = read_stats(self.kstat.as_ref(), &selector).retry_poll()?;

        let mut point = MeasurementPoint::new(timestamp, "memory.vminfo");
        for (statistic, field) in VMINFO.iter().filter(|(s, _)| want_field(s, &self.fields)) {
            let value = stats
                .iter()
                .find(|s| s.statistic == *statistic)
                .and_then(|s| s.value.as_f64());
            match value {
                Some(pages) => point.add_field(*field, pages * self.page_size as f64),
                None => log::debug!("no vminfo statistic {statistic}"),
            }
        }
        acc.push(point);
        Ok(())
    }
}

/// Reports the paging statistics of the `cpu:<n>:vm` kstats.
pub struct CpuVmSource {
    fields: Vec<String>,
    aggregate: bool,
    kstat: Arc<dyn KstatReader>,
}

impl CpuVmSource {
    pub fn new(fields: Vec<String>, aggregate: bool, kstat: Arc<dyn KstatReader>) -> Self {
        Self {
            fields,
            aggregate,
            kstat,
        }
    }
}

impl Source for CpuVmSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.kstat.as_ref(), &KstatSelector::module("cpu").name("vm")).retry_poll()?;

        let mut fields: BTreeMap<String, f64> = BTreeMap::new();
        for stat in stats.iter().filter(|s| want_field(&s.statistic, &self.fields)) {
            let Some(value) = stat.value.as_f64() else {
                continue;
            };
            if self.aggregate {
                *fields.entry(format!("vm.aggregate.{}", stat.statistic)).or_default() += value;
            } else {
                fields.insert(format!("vm.cpu{}.{}", stat.instance, stat.statistic), value);
            }
        }

        acc.push(
            MeasurementPoint::new(timestamp, "memory.cpuVm")
                .with_fields(fields.into_iter().map(|(name, v)| (name, v.into()))),
        );
        Ok(())
    }
}

/// Reports the `memory_cap` kstats of each zone.
pub struct ZoneMemcapSource {
    zones: Vec<String>,
    fields: Vec<String>,
    kstat: Arc<dyn KstatReader>,
}

impl ZoneMemcapSource {
    pub fn new(zones: Vec<String>, fields: Vec<String>, kstat: Arc<dyn KstatReader>) -> Self {
        Self { zones, fields, kstat }
    }
}

impl Source for ZoneMemcapSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let stats = read_stats(self.kstat.as_ref(), &KstatSelector::module("memory_cap")).retry_poll()?;

        // one kstat per zone, named after the zone
        let mut by_zone: BTreeMap<&str, Vec<&NamedStat>> = BTreeMap::new();
        for stat in stats.iter().filter(|s| want(&s.name, &self.zones)) {
            by_zone.entry(stat.name.as_str()).or_default().push(stat);
        }

        for (zone, stats) in by_zone {
            let mut point = MeasurementPoint::new(timestamp, "memory.zone").with_tag("zone", zone);
            for stat in stats.into_iter().filter(|s| want_field(&s.statistic, &self.fields)) {
                if let Some(value) = stat.value.as_f64() {
                    point.add_field(stat.statistic.clone(), value);
                }
            }
            acc.push(point);
        }
        Ok(())
    }
}
