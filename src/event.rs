use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Atom tag for the daemon's own build-info atom, served by the
/// built-in puller registered under [`crate::DAEMON_UID`].
pub const ATOM_BUILD_INFO: i32 = 10001;

/// One typed field payload inside an atom.
///
/// Floats compare and hash bitwise so field values can key aggregation
/// maps.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Str(String),
    Bool(bool),
}

impl Value {
    /// Returns the integer content widened to i64, if numeric.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Int(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            Value::Long(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            Value::Float(v) => {
                2u8.hash(state);
                v.to_bits().hash(state);
            }
            Value::Str(v) => {
                3u8.hash(state);
                v.hash(state);
            }
            Value::Bool(v) => {
                4u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A field id paired with its value. Field ids are 1-based positions
/// within the atom's declared field list; repeated fields appear as
/// multiple entries sharing an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldValue {
    pub field: i32,
    pub value: Value,
}

impl FieldValue {
    pub fn new(field: i32, value: Value) -> Self {
        Self { field, value }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.value)
    }
}

/// One typed event record.
///
/// Timestamps are set once at construction. The only sanctioned
/// mutation is [`LogEvent::stamp`], used by the pull scheduler to mark
/// pulled batches with the request time rather than the completion
/// time.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub atom_tag: i32,
    pub elapsed_ts_ns: i64,
    pub wall_ts_ns: i64,
    pub values: Vec<FieldValue>,
}

impl LogEvent {
    pub fn new(atom_tag: i32, elapsed_ts_ns: i64, wall_ts_ns: i64) -> Self {
        Self {
            atom_tag,
            elapsed_ts_ns,
            wall_ts_ns,
            values: Vec::new(),
        }
    }

    /// Appends a field value, assigning the next 1-based field id.
    pub fn push_value(&mut self, value: Value) {
        let field = self.values.len() as i32 + 1;
        self.values.push(FieldValue::new(field, value));
    }

    /// Appends a field value under an explicit field id. Used for
    /// repeated fields, which share an id.
    pub fn push_field_value(&mut self, field: i32, value: Value) {
        self.values.push(FieldValue::new(field, value));
    }

    /// Rewrites both timestamps. Pulled atoms are stamped with the
    /// time the pull was requested, so downstream bucketing attributes
    /// them to the triggering moment rather than the pull latency.
    pub fn stamp(&mut self, elapsed_ts_ns: i64, wall_ts_ns: i64) {
        self.elapsed_ts_ns = elapsed_ts_ns;
        self.wall_ts_ns = wall_ts_ns;
    }
}

/// Position selector for matchers over repeated fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Position {
    /// Single-valued field, or don't care: first occurrence.
    #[default]
    None,
    /// Any single occurrence is representative.
    Any,
    /// Every occurrence contributes a value.
    All,
    First,
    Last,
}

/// Declarative field selector, as written in a metric configuration.
/// Leaves select event fields; interior nodes group sub-selectors of
/// nested atoms.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldMatcher {
    pub field: i32,
    pub position: Position,
    pub children: Vec<FieldMatcher>,
}

impl FieldMatcher {
    pub fn leaf(field: i32) -> Self {
        Self {
            field,
            position: Position::None,
            children: Vec::new(),
        }
    }

    pub fn with_position(field: i32, position: Position) -> Self {
        Self {
            field,
            position,
            children: Vec::new(),
        }
    }
}

/// Runtime form of a field selector: the leaf list of a matcher tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Matcher {
    pub field: i32,
    pub position: Position,
}

/// Flattens matcher trees into the leaf selectors actually applied to
/// event field lists.
pub fn translate_field_matchers(matchers: &[FieldMatcher]) -> Vec<Matcher> {
    let mut out = Vec::new();
    for m in matchers {
        translate_one(m, &mut out);
    }
    out
}

fn translate_one(matcher: &FieldMatcher, out: &mut Vec<Matcher>) {
    if matcher.children.is_empty() {
        out.push(Matcher {
            field: matcher.field,
            position: matcher.position,
        });
        return;
    }
    for child in &matcher.children {
        translate_one(child, out);
    }
}

/// True if any selector in the tree uses position ALL.
pub fn has_position_all(matchers: &[FieldMatcher]) -> bool {
    matchers
        .iter()
        .any(|m| m.position == Position::All || has_position_all(&m.children))
}

/// Whether report dimensions must be written nested inline per bucket.
/// Position-ALL selectors can yield a variable number of leaves per
/// key, so a single shared dimension path cannot describe them.
pub fn should_use_nested_dimensions(matchers: &[FieldMatcher]) -> bool {
    has_position_all(matchers)
}

/// Shard-sampling decision for a metric with `shard_count > 1`. The
/// same field value always lands in the same shard, so sampling is
/// stable across daemon restarts with a fixed offset.
pub fn should_keep_sample(sample_value: &Value, shard_offset: u32, shard_count: u32) -> bool {
    let mut hasher = DefaultHasher::new();
    sample_value.hash(&mut hasher);
    let hash = hasher.finish() as u32;
    hash.wrapping_add(shard_offset) % shard_count == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_value_assigns_sequential_ids() {
        let mut event = LogEvent::new(7, 100, 200);
        event.push_value(Value::Int(1));
        event.push_value(Value::Str("pkg".into()));
        assert_eq!(event.values[0].field, 1);
        assert_eq!(event.values[1].field, 2);
    }

    #[test]
    fn test_stamp_rewrites_both_timestamps() {
        let mut event = LogEvent::new(7, 100, 200);
        event.stamp(1_000, 2_000);
        assert_eq!(event.elapsed_ts_ns, 1_000);
        assert_eq!(event.wall_ts_ns, 2_000);
    }

    #[test]
    fn test_float_values_compare_bitwise() {
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
        assert_ne!(Value::Float(1.5), Value::Float(1.6));
        assert_ne!(Value::Float(1.0), Value::Int(1));
    }

    #[test]
    fn test_translate_flattens_nested_matchers() {
        let tree = vec![FieldMatcher {
            field: 1,
            position: Position::None,
            children: vec![FieldMatcher::leaf(2), FieldMatcher::leaf(3)],
        }];
        let flat = translate_field_matchers(&tree);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].field, 2);
        assert_eq!(flat[1].field, 3);
    }

    #[test]
    fn test_has_position_all_detects_nested_all() {
        let tree = vec![FieldMatcher {
            field: 1,
            position: Position::None,
            children: vec![FieldMatcher::with_position(2, Position::All)],
        }];
        assert!(has_position_all(&tree));
        assert!(should_use_nested_dimensions(&tree));

        let flat = vec![FieldMatcher::leaf(1)];
        assert!(!has_position_all(&flat));
    }

    #[test]
    fn test_should_keep_sample_is_deterministic() {
        let v = Value::Int(12345);
        let first = should_keep_sample(&v, 3, 4);
        for _ in 0..10 {
            assert_eq!(should_keep_sample(&v, 3, 4), first);
        }
    }

    #[test]
    fn test_should_keep_sample_partitions_values() {
        // Every value lands in exactly one shard for a fixed offset.
        for i in 0..100 {
            let v = Value::Long(i);
            let mut matches = 0;
            for offset in 0..4 {
                if should_keep_sample(&v, offset, 4) {
                    matches += 1;
                }
            }
            assert_eq!(matches, 1, "value {i} matched {matches} shards");
        }
    }
}
