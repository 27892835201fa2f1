use std::collections::HashMap;
use std::fmt;

use crate::event::{FieldValue, Matcher, Position};

/// An ordered list of field values projected out of an atom. Equality
/// is structural, so the key can slice aggregation maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HashableDimensionKey {
    values: Vec<FieldValue>,
}

impl HashableDimensionKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn add_value(&mut self, value: FieldValue) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for HashableDimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// The composite key aggregates are accumulated under: the atom-field
/// slice plus the values of any external states the metric slices on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MetricDimensionKey {
    dimension_in_what: HashableDimensionKey,
    state_values_key: HashableDimensionKey,
}

impl MetricDimensionKey {
    pub fn new(
        dimension_in_what: HashableDimensionKey,
        state_values_key: HashableDimensionKey,
    ) -> Self {
        Self {
            dimension_in_what,
            state_values_key,
        }
    }

    pub fn dimension_in_what(&self) -> &HashableDimensionKey {
        &self.dimension_in_what
    }

    pub fn state_values_key(&self) -> &HashableDimensionKey {
        &self.state_values_key
    }
}

impl fmt::Display for MetricDimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.dimension_in_what, self.state_values_key)
    }
}

/// Identifies a configuration owned by a host app uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    pub uid: i32,
    pub config_id: i64,
}

impl ConfigKey {
    pub fn new(uid: i32, config_id: i64) -> Self {
        Self { uid, config_id }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.uid, self.config_id)
    }
}

/// Identifies a registered puller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PullerKey {
    pub uid: i32,
    pub atom_tag: i32,
}

/// Identifies the receiver list interested in a pulled atom within a
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverKey {
    pub atom_tag: i32,
    pub config_key: ConfigKey,
}

/// Per-condition dimension keys used to query a sliced condition.
pub type ConditionKey = HashMap<i64, HashableDimensionKey>;

/// Ties a metric's condition to atom fields: values projected through
/// `fields_in_what` are relabeled as `fields_in_condition` before the
/// condition tracker is queried.
#[derive(Debug, Clone)]
pub struct MetricConditionLink {
    pub condition_id: i64,
    pub fields_in_what: Vec<Matcher>,
    pub fields_in_condition: Vec<Matcher>,
}

/// Ties a metric's sliced state to atom fields, analogous to
/// [`MetricConditionLink`] but resolving against a state tracker.
#[derive(Debug, Clone)]
pub struct MetricStateLink {
    pub state_atom_id: i32,
    pub fields_in_what: Vec<Matcher>,
    pub fields_in_state: Vec<Matcher>,
}

/// Projects an atom's field values through a matcher list.
pub fn filter_values(matchers: &[Matcher], values: &[FieldValue]) -> HashableDimensionKey {
    let mut key = HashableDimensionKey::default();
    for matcher in matchers {
        match matcher.position {
            Position::All => {
                for v in values.iter().filter(|v| v.field == matcher.field) {
                    key.add_value(v.clone());
                }
            }
            Position::Last => {
                if let Some(v) = values.iter().rev().find(|v| v.field == matcher.field) {
                    key.add_value(v.clone());
                }
            }
            Position::None | Position::Any | Position::First => {
                if let Some(v) = values.iter().find(|v| v.field == matcher.field) {
                    key.add_value(v.clone());
                }
            }
        }
    }
    key
}

/// Extracts the single value selected by one matcher, if present.
pub fn filter_single_value(matcher: &Matcher, values: &[FieldValue]) -> Option<FieldValue> {
    match matcher.position {
        Position::Last => values.iter().rev().find(|v| v.field == matcher.field).cloned(),
        _ => values.iter().find(|v| v.field == matcher.field).cloned(),
    }
}

/// Builds the condition-side key for a link: project through the
/// what-side matchers, then rewrite each value's field id to the
/// corresponding condition-side id.
pub fn dimension_for_condition(
    values: &[FieldValue],
    link: &MetricConditionLink,
) -> HashableDimensionKey {
    relabel_projection(values, &link.fields_in_what, &link.fields_in_condition)
}

/// Builds the state-side primary key for a link.
pub fn dimension_for_state(values: &[FieldValue], link: &MetricStateLink) -> HashableDimensionKey {
    relabel_projection(values, &link.fields_in_what, &link.fields_in_state)
}

fn relabel_projection(
    values: &[FieldValue],
    fields_in_what: &[Matcher],
    fields_in_other: &[Matcher],
) -> HashableDimensionKey {
    let mut key = HashableDimensionKey::default();
    for (what, other) in fields_in_what.iter().zip(fields_in_other.iter()) {
        if let Some(mut v) = filter_single_value(what, values) {
            v.field = other.field;
            key.add_value(v);
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LogEvent, Value};

    fn sample_event() -> LogEvent {
        let mut event = LogEvent::new(42, 100, 200);
        event.push_value(Value::Int(1001)); // field 1: uid
        event.push_value(Value::Str("pkg.a".into())); // field 2: package
        event.push_value(Value::Int(3)); // field 3: state
        event
    }

    fn m(field: i32) -> Matcher {
        Matcher {
            field,
            position: Position::None,
        }
    }

    #[test]
    fn test_filter_values_projects_in_matcher_order() {
        let event = sample_event();
        let key = filter_values(&[m(2), m(1)], &event.values);
        assert_eq!(key.values().len(), 2);
        assert_eq!(key.values()[0].field, 2);
        assert_eq!(key.values()[1].field, 1);
    }

    #[test]
    fn test_filter_values_skips_missing_fields() {
        let event = sample_event();
        let key = filter_values(&[m(9)], &event.values);
        assert!(key.is_empty());
    }

    #[test]
    fn test_filter_values_position_all_takes_every_occurrence() {
        let mut event = LogEvent::new(42, 0, 0);
        event.push_field_value(1, Value::Int(10));
        event.push_field_value(1, Value::Int(20));
        event.push_field_value(2, Value::Int(99));

        let all = Matcher {
            field: 1,
            position: Position::All,
        };
        let key = filter_values(&[all], &event.values);
        assert_eq!(key.values().len(), 2);

        let last = Matcher {
            field: 1,
            position: Position::Last,
        };
        let key = filter_values(&[last], &event.values);
        assert_eq!(key.values(), &[FieldValue::new(1, Value::Int(20))]);
    }

    #[test]
    fn test_dimension_key_as_map_key() {
        let mut map: HashMap<MetricDimensionKey, u64> = HashMap::new();
        let event = sample_event();
        let what = filter_values(&[m(1)], &event.values);
        let key = MetricDimensionKey::new(what, HashableDimensionKey::default());
        map.insert(key.clone(), 5);
        assert_eq!(map.get(&key), Some(&5));
    }

    #[test]
    fn test_dimension_for_condition_relabels_fields() {
        let event = sample_event();
        let link = MetricConditionLink {
            condition_id: 77,
            fields_in_what: vec![m(1)],
            fields_in_condition: vec![m(4)],
        };
        let key = dimension_for_condition(&event.values, &link);
        assert_eq!(key.values().len(), 1);
        assert_eq!(key.values()[0].field, 4);
        assert_eq!(key.values()[0].value, Value::Int(1001));
    }

    #[test]
    fn test_config_key_display() {
        let key = ConfigKey::new(10123, 987);
        assert_eq!(key.to_string(), "(10123,987)");
    }
}
