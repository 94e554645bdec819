//! Allow-lists used by the collectors to decide what to emit.
//!
//! Every collector config has lists such as `fields = ["size", "cap"]`.
//! An empty list means "everything".

/// Fields that are emitted whatever the allow-list says.
///
/// Every kstat has them, and they are needed to turn counters into rates.
pub const ALWAYS_WANTED_FIELDS: [&str; 2] = ["snaptime", "crtime"];

/// Returns `true` if the field `name` should be emitted.
///
/// Matching is exact and case-sensitive. [`ALWAYS_WANTED_FIELDS`] are always wanted.
pub fn want_field(name: &str, allow_list: &[String]) -> bool {
    ALWAYS_WANTED_FIELDS.contains(&name) || want(name, allow_list)
}

/// Returns `true` if `allow_list` is empty or contains `name`.
///
/// Use this for things that are not fields: zones, fmd modules, service states...
pub fn want(name: &str, allow_list: &[String]) -> bool {
    allow_list.is_empty() || allow_list.iter().any(|allowed| allowed == name)
}
