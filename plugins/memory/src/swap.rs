use std::sync::Arc;

use anyhow::anyhow;
use illumos_metrics::{
    command::{CommandRunner, stdout_of},
    filter::want_field,
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    source::{PollError, Retryable, Source},
    text::parse_swap_summary,
};

const SWAP_BINARY: &str = "/usr/sbin/swap";

/// Reports the swap summary of `swap -s`, in bytes.
pub struct SwapSource {
    fields: Vec<String>,
    runner: Arc<dyn CommandRunner>,
}

impl SwapSource {
    pub fn new(fields: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { fields, runner }
    }
}

impl Source for SwapSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let output = stdout_of(self.runner.as_ref(), SWAP_BINARY, &["-s"]).retry_poll()?;
        let summary = parse_swap_summary(&output)
            .ok_or_else(|| anyhow!("unexpected output of swap -s: {output:?}"))
            .retry_poll()?;

        let all = [
            ("allocated", summary.allocated),
            ("reserved", summary.reserved),
            ("used", summary.used),
            ("available", summary.available),
        ];
        let mut point = MeasurementPoint::new(timestamp, "memory.swap");
        for (name, bytes) in all {
            if want_field(name, &self.fields) {
                point.add_field(name, bytes);
            }
        }
        acc.push(point);
        Ok(())
    }
}
