use std::sync::Arc;

use illumos_metrics::{
    command::{CommandRunner, stdout_of},
    filter::want_field,
    measurement::{MeasurementAccumulator, MeasurementPoint, Timestamp},
    source::{PollError, Retryable, Source},
    table::{ColumnRules, Conversion, Header, RowMode, parse_table},
    text::{TimestampAnchor, extract_error_block},
};

use crate::{Config, ZPOOL_BINARY};

/// Polls `zpool list`, then `zpool status` for each pool.
pub struct ZpoolSource {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    rules: ColumnRules,
    resilver: TimestampAnchor,
    scrub: TimestampAnchor,
    last_scrub: TimestampAnchor,
}

impl ZpoolSource {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> anyhow::Result<Self> {
        let rules = ColumnRules::new(Conversion::Skip)
            .with(&["size", "alloc", "free"], Conversion::Bytes)
            .with(&["frag", "cap"], Conversion::Percent)
            .with(&["dedup"], Conversion::Ratio)
            .with(&["health"], Conversion::Health);
        Ok(Self {
            config,
            runner,
            rules,
            resilver: TimestampAnchor::new("resilver in progress since")?,
            scrub: TimestampAnchor::new("scrub in progress since")?,
            last_scrub: TimestampAnchor::new("scrub repaired.*errors on")?,
        })
    }

    fn poll_status(&self, pool: &str, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> anyhow::Result<()> {
        let status = stdout_of(self.runner.as_ref(), ZPOOL_BINARY, &["status", "-pv", pool])?;
        let now = timestamp.to_datetime();

        acc.push(
            MeasurementPoint::new(timestamp, "zpool.status")
                .with_tag("name", pool)
                .with_field("resilverTime", self.resilver.elapsed_seconds(&status, now))
                .with_field("scrubTime", self.scrub.elapsed_seconds(&status, now))
                .with_field("timeSinceScrub", self.last_scrub.elapsed_seconds(&status, now)),
        );

        for device in extract_error_block(&status) {
            acc.push(
                MeasurementPoint::new(timestamp, "zpool.status.errors")
                    .with_tag("pool", pool)
                    .with_tag("device", device.device)
                    .with_tag("state", device.state)
                    .with_field("read", device.read)
                    .with_field("write", device.write)
                    .with_field("cksum", device.cksum),
            );
        }
        Ok(())
    }
}

impl Source for ZpoolSource {
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError> {
        let list = stdout_of(self.runner.as_ref(), ZPOOL_BINARY, &["list"]).retry_poll()?;

        for row in parse_table(&list, Header::parse, &self.rules, RowMode::Strict) {
            let fields = row
                .values
                .into_iter()
                .filter(|(name, _)| want_field(name, &self.config.fields));
            acc.push(
                MeasurementPoint::new(timestamp, "zpool")
                    .with_tag("name", &row.key)
                    .with_fields(fields),
            );

            if self.config.status {
                if let Err(e) = self.poll_status(&row.key, acc, timestamp) {
                    log::warn!("no status for pool {}: {e:#}", row.key);
                }
            }
        }
        Ok(())
    }
}
