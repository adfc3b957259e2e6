//! Structural event filters.
//!
//! A filter is a shape that a candidate frame must contain: every key named
//! by the filter must be present and recursively matching in the candidate,
//! extra candidate keys are ignored. Matching never fails with an error —
//! a missing key or a shape mismatch is simply a non-match.

use std::collections::BTreeMap;

use serde_json::Value;

/// A structural predicate over JSON frames.
///
/// Built from a [`Value`] via `From`, which decomposes objects and arrays
/// into [`EventFilter::Object`] and [`EventFilter::List`] nodes. The
/// [`EventFilter::AnyOf`] node has no JSON literal form and is constructed
/// explicitly when "one of these alternatives" semantics are needed.
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Deep equality with the candidate value.
    Eq(Value),
    /// Every key must be present in the candidate and match recursively.
    Object(BTreeMap<String, EventFilter>),
    /// Elementwise correspondence with the candidate array, equal length.
    List(Vec<EventFilter>),
    /// At least one candidate-side element deep-matches one alternative.
    /// Against a non-array candidate, the candidate itself is the element.
    AnyOf(Vec<EventFilter>),
}

impl EventFilter {
    /// Test the filter against a candidate frame.
    pub fn matches(&self, candidate: &Value) -> bool {
        match self {
            EventFilter::Eq(expected) => expected == candidate,
            EventFilter::Object(keys) => match candidate {
                Value::Object(map) => keys
                    .iter()
                    .all(|(k, f)| map.get(k).is_some_and(|v| f.matches(v))),
                _ => false,
            },
            EventFilter::List(items) => match candidate {
                Value::Array(values) => {
                    values.len() == items.len()
                        && items.iter().zip(values).all(|(f, v)| f.matches(v))
                }
                _ => false,
            },
            EventFilter::AnyOf(alternatives) => {
                let elements: &[Value] = match candidate {
                    Value::Array(values) => values,
                    other => std::slice::from_ref(other),
                };
                elements
                    .iter()
                    .any(|v| alternatives.iter().any(|f| f.matches(v)))
            }
        }
    }
}

impl From<Value> for EventFilter {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => EventFilter::Object(
                map.into_iter()
                    .map(|(k, v)| (k, EventFilter::from(v)))
                    .collect(),
            ),
            Value::Array(values) => {
                EventFilter::List(values.into_iter().map(EventFilter::from).collect())
            }
            scalar => EventFilter::Eq(scalar),
        }
    }
}
