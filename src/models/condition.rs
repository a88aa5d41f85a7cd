// Condition descriptors for rules, transition guards and the condition registry

//! # Condition Module
//!
//! Conditions are pure data. They are embedded in behavior rules, in state transition guards
//! and in the standalone condition registry, and are evaluated by
//! [`ConditionEvaluator`](crate::engine::conditions::ConditionEvaluator).
//!
//! ## Rust Learning Notes:
//!
//! ### Serde Tag for JSON Serialization
//! The `#[serde(tag = "type")]` attribute creates "tagged union" JSON:
//! `{"type": "threshold", "variable": "temperature", "operator": ">", "threshold": 30.0}`
//!
//! Nested kinds use their own tag field (`time_type`, `spatial_type`, `relation_type`) so
//! a condition stays one flat JSON object.
//!
//! ### Untagged Conditions
//! A condition object without a `type` field is a simple condition. Lists of conditions
//! (rule conditions, transition guards, complex sub-conditions) go through
//! [`deserialize_conditions`], which fills in the tag before the tagged parse.
//!
//! ### The Unknown Variant
//! `#[serde(other)]` catches any tag we don't know about. Unknown kinds are accepted at
//! parse time and simply evaluate to `false`.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A single condition that can be evaluated against an evaluation context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Numeric comparison of a context variable against a threshold
    ///
    /// Example: `{"type": "threshold", "variable": "temperature", "operator": ">", "threshold": 30}`
    Threshold {
        variable: String,
        operator: ComparisonOperator,
        threshold: f64,
    },

    /// Time of day, day of week, date range or elapsed duration
    Time(TimeCondition),

    /// Distance, point-in-boundary or bounds intersection
    Spatial(SpatialCondition),

    /// Dependency, parent-child or connection membership
    Relational(RelationalCondition),

    /// Logical combination of sub-conditions
    ///
    /// Example: `{"type": "complex", "logic": "OR", "conditions": [...]}`
    Complex {
        logic: LogicOperator,
        #[serde(default, deserialize_with = "deserialize_conditions")]
        conditions: Vec<Condition>,
    },

    /// Equality or membership test on a context variable
    ///
    /// Example: `{"type": "simple", "variable": "status", "operator": "in", "value": ["on", "idle"]}`
    Simple {
        variable: String,
        operator: MembershipOperator,
        value: serde_json::Value,
    },

    /// Any condition kind this runtime does not understand
    #[serde(other)]
    Unknown,
}

/// Operators for threshold conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl ComparisonOperator {
    /// Apply the operator with IEEE-754 semantics
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::GreaterThan => value > threshold,
            ComparisonOperator::LessThan => value < threshold,
            ComparisonOperator::GreaterOrEqual => value >= threshold,
            ComparisonOperator::LessOrEqual => value <= threshold,
            ComparisonOperator::Equal => value == threshold,
            ComparisonOperator::NotEqual => value != threshold,
        }
    }
}

/// Operators for simple conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipOperator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
}

/// Logic operators for complex conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicOperator {
    And,
    Or,
    Not,
}

/// Time based conditions, tagged by `time_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "time_type", rename_all = "snake_case")]
pub enum TimeCondition {
    /// Holds while `start <= now <= end`; either bound may be omitted
    Window {
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        #[serde(default)]
        end: Option<DateTime<Utc>>,
    },

    /// Day-of-week and hour-of-day window
    ///
    /// `days` uses 0 = Monday ... 6 = Sunday. The hour window is inclusive and only applies
    /// when both bounds are present.
    Schedule {
        #[serde(default)]
        days: Vec<u32>,
        #[serde(default)]
        start_hour: Option<u32>,
        #[serde(default)]
        end_hour: Option<u32>,
    },

    /// Holds while no more than `duration_seconds` have elapsed since the instant stored
    /// in the context variable `since`
    Duration {
        #[serde(default = "default_since_variable")]
        since: String,
        duration_seconds: f64,
    },
}

fn default_since_variable() -> String {
    "start_time".to_string()
}

/// A point in canvas space; missing coordinates default to zero
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Point {
    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Axis aligned rectangle; omitted bounds are unbounded
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default = "neg_infinity")]
    pub min_x: f64,
    #[serde(default = "pos_infinity")]
    pub max_x: f64,
    #[serde(default = "neg_infinity")]
    pub min_y: f64,
    #[serde(default = "pos_infinity")]
    pub max_y: f64,
}

fn neg_infinity() -> f64 {
    f64::NEG_INFINITY
}

fn pos_infinity() -> f64 {
    f64::INFINITY
}

impl Bounds {
    pub fn contains(&self, point: &Point) -> bool {
        self.min_x <= point.x && point.x <= self.max_x && self.min_y <= point.y && point.y <= self.max_y
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y)
    }
}

/// Spatial conditions, tagged by `spatial_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "spatial_type", rename_all = "snake_case")]
pub enum SpatialCondition {
    /// Distance between the context position and `target_position` is at most `max_distance`
    Proximity {
        target_position: Point,
        max_distance: f64,
        #[serde(default = "default_position_variable")]
        position_variable: String,
    },

    /// The context position lies inside `boundary`
    Containment {
        boundary: Bounds,
        #[serde(default = "default_position_variable")]
        position_variable: String,
    },

    /// Two bounding boxes overlap
    Intersection {
        object1_bounds: Bounds,
        object2_bounds: Bounds,
    },
}

fn default_position_variable() -> String {
    "position".to_string()
}

/// Relational conditions, tagged by `relation_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "relation_type", rename_all = "snake_case")]
pub enum RelationalCondition {
    /// `context.dependencies[dependent_element] == required_status`
    Dependency {
        dependent_element: String,
        #[serde(default = "default_required_status")]
        required_status: String,
    },

    /// `context.parent == parent_element`
    Hierarchy { parent_element: String },

    /// Every listed element appears in `context.connections`
    Connection { connected_elements: Vec<String> },
}

fn default_required_status() -> String {
    "active".to_string()
}

// Builder methods for easier condition construction
impl Condition {
    /// Create a threshold condition
    ///
    /// ## Example:
    /// ```
    /// use canvas_runtime::models::{Condition, ComparisonOperator};
    ///
    /// let hot = Condition::threshold("temperature", ComparisonOperator::GreaterThan, 30.0);
    /// ```
    pub fn threshold(variable: &str, operator: ComparisonOperator, threshold: f64) -> Self {
        Condition::Threshold {
            variable: variable.to_string(),
            operator,
            threshold,
        }
    }

    /// Create a simple equality condition
    pub fn equals(variable: &str, value: serde_json::Value) -> Self {
        Condition::Simple {
            variable: variable.to_string(),
            operator: MembershipOperator::Equal,
            value,
        }
    }

    /// Create a simple membership condition
    pub fn one_of(variable: &str, values: Vec<serde_json::Value>) -> Self {
        Condition::Simple {
            variable: variable.to_string(),
            operator: MembershipOperator::In,
            value: serde_json::Value::Array(values),
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Complex {
            logic: LogicOperator::And,
            conditions,
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Complex {
            logic: LogicOperator::Or,
            conditions,
        }
    }

    pub fn not(condition: Condition) -> Self {
        Condition::Complex {
            logic: LogicOperator::Not,
            conditions: vec![condition],
        }
    }

    /// Parse one condition; an object without `type` is read as a simple condition
    pub fn from_json_value(mut value: Value) -> serde_json::Result<Self> {
        if let Value::Object(fields) = &mut value {
            fields
                .entry("type")
                .or_insert_with(|| Value::String("simple".to_string()));
        }
        serde_json::from_value(value)
    }
}

/// Deserialize a list of conditions, treating untagged entries as simple conditions
pub fn deserialize_conditions<'de, D>(deserializer: D) -> Result<Vec<Condition>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<Value>::deserialize(deserializer)?
        .into_iter()
        .map(|value| Condition::from_json_value(value).map_err(D::Error::custom))
        .collect()
}
