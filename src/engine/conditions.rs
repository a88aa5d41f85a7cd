// Condition evaluation against an element context

//! # Condition Evaluator
//!
//! Turns a [`Condition`] and an [`EvaluationContext`] into a boolean. Evaluation never fails:
//! an unknown condition kind, a missing context variable or a value of the wrong shape all
//! evaluate to `false`.
//!
//! ## Context Layout
//!
//! The context is a flat JSON object plus a few well-known nested entries:
//!
//! ```json
//! {
//!   "element_id": "ahu-3",
//!   "element_type": "air_handler",
//!   "temperature": 35.0,
//!   "status": "active",
//!   "position": {"x": 10.0, "y": 4.0},
//!   "dependencies": {"chiller-1": "active"},
//!   "parent": "floor-2",
//!   "connections": ["duct-7", "duct-8"],
//!   "start_time": "2024-03-10T09:00:00Z"
//! }
//! ```
//!
//! ## Logic Operators
//!
//! - `AND` stops at the first false sub-condition; `AND` over nothing holds.
//! - `OR` stops at the first true sub-condition; `OR` over nothing does not hold.
//! - `NOT` negates exactly one sub-condition. `NOT` over nothing holds; `NOT` over more than
//!   one sub-condition is malformed and evaluates to `false`.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::{
    Condition, LogicOperator, MembershipOperator, Point, RelationalCondition,
    SpatialCondition, TimeCondition,
};

/// Values a condition is evaluated against, plus the evaluation instant
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    values: Map<String, Value>,
    now: DateTime<Utc>,
}

impl EvaluationContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            values: Map::new(),
            now,
        }
    }

    /// Build a context from a JSON object; any other JSON value yields an empty context
    pub fn from_value(value: Value, now: DateTime<Utc>) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { values, now }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn element_type(&self) -> Option<&str> {
        self.str("element_type")
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }

    /// Copy entries of `other` that are not set yet
    pub fn merge_missing(&mut self, other: &Map<String, Value>) {
        for (key, value) in other {
            self.values.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

/// Stateless evaluator for condition descriptors
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        ConditionEvaluator
    }

    /// Evaluate every condition with AND semantics, stopping at the first that fails
    pub fn evaluate_all(&self, conditions: &[Condition], context: &EvaluationContext) -> bool {
        conditions.iter().all(|c| self.evaluate(c, context))
    }

    pub fn evaluate(&self, condition: &Condition, context: &EvaluationContext) -> bool {
        match condition {
            Condition::Threshold {
                variable,
                operator,
                threshold,
            } => match context.number(variable) {
                Some(value) => operator.compare(value, *threshold),
                None => {
                    debug!(variable = %variable, "threshold variable missing or not numeric");
                    false
                }
            },
            Condition::Time(time) => self.evaluate_time(time, context),
            Condition::Spatial(spatial) => self.evaluate_spatial(spatial, context),
            Condition::Relational(relation) => self.evaluate_relational(relation, context),
            Condition::Complex { logic, conditions } => {
                self.evaluate_complex(*logic, conditions, context)
            }
            Condition::Simple {
                variable,
                operator,
                value,
            } => match context.get(variable) {
                Some(actual) => evaluate_membership(*operator, actual, value),
                None => false,
            },
            Condition::Unknown => {
                warn!("unknown condition kind evaluates to false");
                false
            }
        }
    }

    fn evaluate_complex(
        &self,
        logic: LogicOperator,
        conditions: &[Condition],
        context: &EvaluationContext,
    ) -> bool {
        match logic {
            LogicOperator::And => conditions.iter().all(|c| self.evaluate(c, context)),
            LogicOperator::Or => conditions.iter().any(|c| self.evaluate(c, context)),
            LogicOperator::Not => match conditions {
                [] => true,
                [single] => !self.evaluate(single, context),
                _ => {
                    warn!(count = conditions.len(), "NOT expects a single sub-condition");
                    false
                }
            },
        }
    }

    fn evaluate_time(&self, condition: &TimeCondition, context: &EvaluationContext) -> bool {
        let now = context.now();
        match condition {
            TimeCondition::Window { start, end } => {
                start.map_or(true, |start| now >= start) && end.map_or(true, |end| now <= end)
            }
            TimeCondition::Schedule {
                days,
                start_hour,
                end_hour,
            } => {
                if !days.is_empty() && !days.contains(&now.weekday().num_days_from_monday()) {
                    return false;
                }
                match (start_hour, end_hour) {
                    (Some(start), Some(end)) => (*start..=*end).contains(&now.hour()),
                    _ => true,
                }
            }
            TimeCondition::Duration {
                since,
                duration_seconds,
            } => match context.get(since).and_then(parse_instant) {
                Some(started) => {
                    let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
                    elapsed <= *duration_seconds
                }
                None => false,
            },
        }
    }

    fn evaluate_spatial(&self, condition: &SpatialCondition, context: &EvaluationContext) -> bool {
        match condition {
            SpatialCondition::Proximity {
                target_position,
                max_distance,
                position_variable,
            } => match position(context, position_variable) {
                Some(current) => current.distance_to(target_position) <= *max_distance,
                None => false,
            },
            SpatialCondition::Containment {
                boundary,
                position_variable,
            } => position(context, position_variable)
                .map_or(false, |current| boundary.contains(&current)),
            SpatialCondition::Intersection {
                object1_bounds,
                object2_bounds,
            } => object1_bounds.intersects(object2_bounds),
        }
    }

    fn evaluate_relational(
        &self,
        condition: &RelationalCondition,
        context: &EvaluationContext,
    ) -> bool {
        match condition {
            RelationalCondition::Dependency {
                dependent_element,
                required_status,
            } => context
                .get("dependencies")
                .and_then(|deps| deps.get(dependent_element))
                .and_then(Value::as_str)
                .map_or(false, |status| status == required_status),
            RelationalCondition::Hierarchy { parent_element } => {
                context.str("parent") == Some(parent_element.as_str())
            }
            RelationalCondition::Connection { connected_elements } => {
                match context.get("connections").and_then(Value::as_array) {
                    Some(connections) => connected_elements
                        .iter()
                        .all(|e| connections.iter().any(|c| c.as_str() == Some(e.as_str()))),
                    None => false,
                }
            }
        }
    }
}

fn position(context: &EvaluationContext, variable: &str) -> Option<Point> {
    match context.get(variable)? {
        value @ Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        Value::Array(coords) => {
            let x = coords.first()?.as_f64()?;
            let y = coords.get(1)?.as_f64()?;
            let z = coords.get(2).and_then(Value::as_f64).unwrap_or(0.0);
            Some(Point { x, y, z })
        }
        _ => None,
    }
}

/// RFC 3339 strings and unix timestamps (seconds) are both accepted
fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = (n.as_f64()? * 1000.0) as i64;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

fn evaluate_membership(operator: MembershipOperator, actual: &Value, expected: &Value) -> bool {
    match operator {
        MembershipOperator::Equal => values_equal(actual, expected),
        MembershipOperator::NotEqual => !values_equal(actual, expected),
        MembershipOperator::In => contains(expected, actual),
        MembershipOperator::NotIn => match expected {
            Value::Array(_) | Value::String(_) => !contains(expected, actual),
            _ => false,
        },
    }
}

/// JSON equality where numbers compare by value, so `35` equals `35.0`
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Membership in an array, or substring of a string
fn contains(container: &Value, item: &Value) -> bool {
    match (container, item) {
        (Value::Array(items), _) => items.iter().any(|candidate| values_equal(candidate, item)),
        (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
        _ => false,
    }
}
