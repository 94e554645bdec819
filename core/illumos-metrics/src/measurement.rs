//! Measurement points and buffers.
//!
//! Each poll of a collector produces [`MeasurementPoint`]s: a measurement name such as `zpool`,
//! a flat map of fields (the values) and a flat map of tags (what the values are about).
//! Sources push their points to a [`MeasurementAccumulator`].
//!
//! ```
//! use illumos_metrics::measurement::{MeasurementBuffer, MeasurementPoint, Timestamp};
//!
//! let mut buffer = MeasurementBuffer::new();
//! let mut acc = buffer.as_accumulator();
//! acc.push(
//!     MeasurementPoint::new(Timestamp::now(), "zpool")
//!         .with_tag("name", "rpool")
//!         .with_field("cap", 28_i64),
//! );
//! assert_eq!(buffer.len(), 1);
//! ```

use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt::{self, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use time::OffsetDateTime;

/// The time of a measurement.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Returns a `Timestamp` representing the current system time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Returns the number of seconds and nanoseconds since the Unix epoch.
    /// Times before the epoch are clamped to it.
    pub fn to_unix_timestamp(&self) -> (u64, u32) {
        let t = self.0.duration_since(UNIX_EPOCH).unwrap_or_default();
        (t.as_secs(), t.subsec_nanos())
    }

    pub fn to_datetime(&self) -> OffsetDateTime {
        OffsetDateTime::from(self.0)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The value of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    F64(f64),
    I64(i64),
    U64(u64),
    Str(String),
}

impl FieldValue {
    /// NaN and infinite floats cannot be written as line protocol.
    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::F64(x) => x.is_finite(),
            _ => true,
        }
    }

    /// Returns the value as a float, or `None` for strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::F64(x) => Some(*x),
            FieldValue::I64(x) => Some(*x as f64),
            FieldValue::U64(x) => Some(*x as f64),
            FieldValue::Str(_) => None,
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::F64(x) => write!(f, "{x}"),
            FieldValue::I64(x) => write!(f, "{x}i"),
            FieldValue::U64(x) => write!(f, "{x}u"),
            FieldValue::Str(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::F64(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::I64(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::U64(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_owned())
    }
}

/// A set of values measured at a given point in time, with their tags.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementPoint {
    /// The name of the measurement, like `zpool.status`.
    pub name: Cow<'static, str>,

    /// The time of the measurement.
    pub timestamp: Timestamp,

    fields: BTreeMap<String, FieldValue>,
    tags: BTreeMap<String, String>,
}

impl MeasurementPoint {
    /// Creates a new `MeasurementPoint` without fields or tags.
    pub fn new(timestamp: Timestamp, name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            fields: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Sets a field. If a field with the same name already exists, its value is replaced.
    pub fn add_field(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Sets a field, and returns self to allow for method chaining.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.add_field(name, value);
        self
    }

    /// Sets multiple fields at once.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = (String, FieldValue)>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Sets a tag. If a tag with the same name already exists, its value is replaced.
    pub fn add_tag(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(name.into(), value.into());
    }

    /// Sets a tag, and returns self to allow for method chaining.
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_tag(name, value);
        self
    }

    /// Sets multiple tags at once.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = (String, String)>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// Iterates on the fields, sorted by name.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates on the tags, sorted by name.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn fields_len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the point has at least one field that [`Display`] writes.
    pub fn is_printable(&self) -> bool {
        self.fields.values().any(FieldValue::is_finite)
    }
}

/// Renders the point on one line: `name,tag=value field=value unix_nanos`.
///
/// Non-finite floats are left out.
impl Display for MeasurementPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn escape(s: &str) -> Cow<'_, str> {
            if s.contains(['\\', ' ', ',', '=']) {
                let mut escaped = String::with_capacity(s.len() + 4);
                for c in s.chars() {
                    if matches!(c, '\\' | ' ' | ',' | '=') {
                        escaped.push('\\');
                    }
                    escaped.push(c);
                }
                Cow::Owned(escaped)
            } else {
                Cow::Borrowed(s)
            }
        }

        f.write_str(&escape(&self.name))?;
        for (k, v) in &self.tags {
            write!(f, ",{}={}", escape(k), escape(v))?;
        }
        let mut sep = ' ';
        for (k, v) in self.fields.iter().filter(|(_, v)| v.is_finite()) {
            write!(f, "{sep}{}={v}", escape(k))?;
            sep = ',';
        }
        let (secs, nanos) = self.timestamp.to_unix_timestamp();
        write!(f, " {}", u128::from(secs) * 1_000_000_000 + u128::from(nanos))
    }
}

/// A `MeasurementBuffer` stores measured data points.
#[derive(Debug, Clone, Default)]
pub struct MeasurementBuffer {
    points: Vec<MeasurementPoint>,
}

impl MeasurementBuffer {
    /// Constructs a new buffer.
    pub fn new() -> MeasurementBuffer {
        MeasurementBuffer { points: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> MeasurementBuffer {
        MeasurementBuffer {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Adds a measurement to the buffer.
    pub fn push(&mut self, point: MeasurementPoint) {
        self.points.push(point);
    }

    /// Moves all the points of `other` to `self`.
    pub fn merge(&mut self, other: &mut MeasurementBuffer) {
        self.points.append(&mut other.points);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MeasurementPoint> {
        self.points.iter()
    }

    /// Returns the points that have the given measurement name, in insertion order.
    pub fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MeasurementPoint> {
        self.points.iter().filter(move |p| p.name == name)
    }

    /// Returns a `MeasurementAccumulator` that will push all measurements to this buffer.
    pub fn as_accumulator(&mut self) -> MeasurementAccumulator<'_> {
        MeasurementAccumulator(self)
    }
}

impl<'a> IntoIterator for &'a MeasurementBuffer {
    type Item = &'a MeasurementPoint;
    type IntoIter = std::slice::Iter<'a, MeasurementPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl IntoIterator for MeasurementBuffer {
    type Item = MeasurementPoint;
    type IntoIter = std::vec::IntoIter<MeasurementPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}

/// An accumulator stores measured data points.
/// Unlike a [`MeasurementBuffer`], the accumulator only allows to push new points.
///
/// Points without any field carry no data and are dropped.
pub struct MeasurementAccumulator<'a>(&'a mut MeasurementBuffer);

impl MeasurementAccumulator<'_> {
    /// Adds a measurement point.
    pub fn push(&mut self, point: MeasurementPoint) {
        if point.fields.is_empty() {
            log::trace!("dropping measurement {} without fields", point.name);
            return;
        }
        self.0.push(point)
    }
}
