use std::{collections::BTreeMap, sync::Arc};

use illumos_metrics::{
    command::{CommandRunner, Elevation},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    source::{PollError, Retryable, Source},
    text::{FaultReport, extract_fault_classes, parse_fault_impact},
};

use crate::{FMADM_BINARY, FmadmMode};

/// Reports the faults listed by `fmadm faulty`.
pub struct FmadmSource {
    mode: FmadmMode,
    elevation: Elevation,
    runner: Arc<dyn CommandRunner>,
}

impl FmadmSource {
    pub fn new(mode: FmadmMode, elevation: Elevation, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            mode,
            elevation,
            runner,
        }
    }
}

impl Source for FmadmSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        match self.mode {
            FmadmMode::Impacts => {
                let output = self
                    .elevation
                    .run(self.runner.as_ref(), FMADM_BINARY, &["faulty", "-arf"])
                    .retry_poll()?;
                for tags in output.lines().filter_map(parse_fault_impact) {
                    acc.push(
                        MeasurementPoint::new(timestamp, "fma.fmadm")
                            .with_tags(tags)
                            .with_field("faults", 1_u64),
                    );
                }
            }
            FmadmMode::Classes => {
                let output = self
                    .elevation
                    .run(self.runner.as_ref(), FMADM_BINARY, &["faulty"])
                    .retry_poll()?;
                let mut counts: BTreeMap<String, u64> = BTreeMap::new();
                for class in extract_fault_classes(&output, FaultReport::Verbose) {
                    *counts.entry(class.replace('.', "_")).or_default() += 1;
                }
                push_counts(acc, timestamp, counts);
            }
            FmadmMode::Statuses => {
                let output = self
                    .elevation
                    .run(self.runner.as_ref(), FMADM_BINARY, &["faulty", "-arf"])
                    .retry_poll()?;
                let mut counts: BTreeMap<String, u64> = BTreeMap::new();
                for status in extract_fault_classes(&output, FaultReport::Short) {
                    *counts.entry(status).or_default() += 1;
                }
                push_counts(acc, timestamp, counts);
            }
        }
        Ok(())
    }
}

fn push_counts(acc: &mut MeasurementAccumulator, timestamp: Timestamp, counts: BTreeMap<String, u64>) {
    // without any fault, the point has no field and is dropped
    acc.push(
        MeasurementPoint::new(timestamp, "fma.fmadm")
            .with_fields(counts.into_iter().map(|(key, n)| (key, n.into()))),
    );
}
