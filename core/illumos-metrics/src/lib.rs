//! Parsers and collector framework for illumos system metrics.
//!
//! illumos exposes most of its state through commands meant for humans (`zpool list`,
//! `fmadm faulty`, `svcs`...) and through kernel statistics (kstats). This crate turns both
//! into measurement points:
//!
//! - [`units`] converts sizes like `2.5K` to bytes and back.
//! - [`inventory`] parses the colon-separated records of `zoneadm` and `dladm`.
//! - [`table`] parses whitespace-aligned tables, like `zpool list` and `fmstat`.
//! - [`text`] extracts timestamps, error counts and fault classes from free-form text.
//! - [`filter`] decides which fields are emitted.
//!
//! Collectors are [plugins](plugin) that register [sources](source). An [`agent::Agent`]
//! polls them and gathers their [measurements](measurement).

pub mod agent;
pub mod command;
pub mod filter;
pub mod inventory;
pub mod kstat;
pub mod measurement;
pub mod plugin;
pub mod source;
pub mod table;
pub mod text;
pub mod units;
