use std::sync::Arc;

use illumos_metrics::{
    command::{CommandRunner, stdout_of},
    filter::{want, want_field},
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    source::{PollError, Retryable, Source},
    table::{ColumnRules, Conversion, Header, RowMode, parse_table},
};

use crate::FMSTAT_BINARY;

/// Reports the statistics of each fmd module, from `fmstat`.
pub struct FmstatSource {
    modules: Vec<String>,
    fields: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    rules: ColumnRules,
}

impl FmstatSource {
    pub fn new(modules: Vec<String>, fields: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        let rules = ColumnRules::new(Conversion::Float)
            .with(&["module"], Conversion::Skip)
            .with(&["memsz", "bufsz"], Conversion::Bytes);
        Self {
            modules,
            fields,
            runner,
            rules,
        }
    }
}

impl Source for FmstatSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let output = stdout_of(self.runner.as_ref(), FMSTAT_BINARY, &[]).retry_poll()?;

        // rows are zipped with the header: a short row keeps its leading columns and a long one
        // loses its trailing values
        let rows = parse_table(&output, Header::parse_percent_prefixed, &self.rules, RowMode::Truncate);
        for row in rows.into_iter().filter(|r| want(&r.key, &self.modules)) {
            let fields = row.values.into_iter().filter(|(name, _)| want_field(name, &self.fields));
            acc.push(
                MeasurementPoint::new(timestamp, "fma.fmstat")
                    .with_tag("module", row.key)
                    .with_fields(fields),
            );
        }
        Ok(())
    }
}
