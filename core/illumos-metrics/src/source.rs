//! Sources are the units of collection: a plugin registers one source per kind of
//! measurement, and the agent polls each of them once per collection.

use thiserror::Error;

use crate::measurement::{MeasurementAccumulator, Timestamp};

pub trait Source: Send {
    /// Pushes the current measurements to `acc`, all stamped with `timestamp`.
    ///
    /// Points pushed before an error are kept.
    fn poll(&mut self, acc: &mut MeasurementAccumulator, timestamp: Timestamp) -> Result<(), PollError>;
}

#[derive(Debug, Error)]
pub enum PollError {
    /// The source cannot work anymore. The agent drops it.
    #[error("source is broken: {0:#}")]
    Fatal(anyhow::Error),
    /// Only this poll failed, for instance because `zpool status` ran while a pool was exported.
    #[error("poll failed, will retry: {0:#}")]
    CanRetry(anyhow::Error),
}

impl PollError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PollError::Fatal(_))
    }
}

/// `?` on an [`anyhow::Error`] is fatal unless it goes through [`Retryable::retry_poll`].
impl From<anyhow::Error> for PollError {
    fn from(e: anyhow::Error) -> Self {
        PollError::Fatal(e)
    }
}

pub trait Retryable<T> {
    /// Marks the error as [`PollError::CanRetry`].
    fn retry_poll(self) -> Result<T, PollError>;
}

impl<T, E: Into<anyhow::Error>> Retryable<T> for Result<T, E> {
    fn retry_poll(self) -> Result<T, PollError> {
        self.map_err(|e| PollError::CanRetry(e.into()))
    }
}
