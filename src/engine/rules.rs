// Rules engine for element behavior evaluation

//! # Rules Engine Module
//!
//! This module provides the central rules engine that decides which behavior rules apply to
//! an element in a given context, and in which order their actions should run.
//!
//! ## Key Features
//!
//! - **Rule Registry**: rules are stored by id; registering an existing id replaces it in place
//! - **Element Scoping**: `target_elements` / `element_types` metadata narrows a rule down
//! - **Priority Ordering**: matches come back highest priority first, ties in registration order
//! - **Condition Registry**: named conditions that can be evaluated on their own
//!
//! ## Rust Learning Notes:
//!
//! ### Copy-On-Write Snapshots
//! The rule table is an `Arc<Vec<BehaviorRule>>` behind an `RwLock`. Evaluation clones the
//! `Arc` (a pointer copy) and releases the lock immediately; writers build a new vector and
//! swap it in. An evaluation therefore always sees one consistent rule set, no matter what
//! registrations happen while it runs.
//!
//! ### Stable Sorting
//! `Vec::sort_by` is a stable sort, so rules with equal priority keep their registration order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::engine::conditions::{ConditionEvaluator, EvaluationContext};
use crate::models::{BehaviorRule, Condition, RuleMatch};
use crate::{CanvasRuntimeError, Result};

/// Central rules engine for element behavior
///
/// ## Usage Example:
///
/// ```rust
/// use canvas_runtime::{EvaluationContext, RuleEngine};
/// use canvas_runtime::models::{BehaviorRule, ComparisonOperator, Condition, RuleType};
/// use serde_json::json;
///
/// let engine = RuleEngine::new();
/// engine.register_rule(
///     BehaviorRule::new("hot", RuleType::Safety)
///         .with_condition(Condition::threshold("temperature", ComparisonOperator::GreaterThan, 30.0)),
/// ).unwrap();
///
/// let context = EvaluationContext::from_value(json!({"temperature": 35}), chrono::Utc::now());
/// let matches = engine.evaluate_rules("ahu-3", &context);
/// assert_eq!(matches[0].rule_id, "hot");
/// ```
#[derive(Debug, Default)]
pub struct RuleEngine {
    /// Registered rules in registration order
    rules: RwLock<Arc<Vec<BehaviorRule>>>,

    /// Standalone conditions, evaluated by name
    conditions: RwLock<HashMap<String, Condition>>,

    evaluator: ConditionEvaluator,
}

impl RuleEngine {
    /// Create an empty rules engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule, replacing any rule with the same id
    pub fn register_rule(&self, rule: BehaviorRule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(CanvasRuntimeError::Validation(
                "rule id must not be empty".to_string(),
            ));
        }

        let mut table = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut rules: Vec<BehaviorRule> = table.to_vec();
        match rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => {
                debug!(rule_id = %rule.id, "replacing behavior rule");
                *existing = rule;
            }
            None => {
                info!(rule_id = %rule.id, rule_type = ?rule.rule_type, priority = rule.priority, "registered behavior rule");
                rules.push(rule);
            }
        }
        *table = Arc::new(rules);
        Ok(())
    }

    /// Remove a rule; returns whether it existed
    pub fn unregister_rule(&self, rule_id: &str) -> bool {
        let mut table = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if !table.iter().any(|rule| rule.id == rule_id) {
            return false;
        }
        let rules: Vec<BehaviorRule> = table
            .iter()
            .filter(|rule| rule.id != rule_id)
            .cloned()
            .collect();
        *table = Arc::new(rules);
        info!(rule_id, "unregistered behavior rule");
        true
    }

    /// Enable or disable a rule without touching anything else
    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut table = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut rules: Vec<BehaviorRule> = table.to_vec();
        let rule = rules
            .iter_mut()
            .find(|rule| rule.id == rule_id)
            .ok_or_else(|| CanvasRuntimeError::not_found("rule", rule_id))?;
        rule.enabled = enabled;
        *table = Arc::new(rules);
        Ok(())
    }

    /// Consistent snapshot of the rule table
    fn snapshot(&self) -> Arc<Vec<BehaviorRule>> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<BehaviorRule> {
        self.snapshot().iter().find(|rule| rule.id == rule_id).cloned()
    }

    /// All registered rules in registration order
    pub fn get_registered_rules(&self) -> Vec<BehaviorRule> {
        self.snapshot().to_vec()
    }

    pub fn rule_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Evaluate every enabled rule that applies to `element_id`
    ///
    /// A rule matches when all of its conditions hold. Matches are sorted by priority,
    /// highest first; equal priorities keep registration order. Evaluation never mutates
    /// the rules and never runs their actions.
    pub fn evaluate_rules(&self, element_id: &str, context: &EvaluationContext) -> Vec<RuleMatch> {
        let rules = self.snapshot();
        let element_type = context.element_type();

        let mut matches: Vec<RuleMatch> = rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter(|rule| rule.applies_to(element_id, element_type))
            .filter(|rule| self.evaluator.evaluate_all(&rule.conditions, context))
            .map(RuleMatch::from)
            .collect();

        matches.sort_by(|a, b| b.priority.cmp(&a.priority));

        debug!(
            element_id,
            evaluated = rules.len(),
            matched = matches.len(),
            "evaluated behavior rules"
        );
        matches
    }

    /// Register a named standalone condition, replacing any with the same id
    pub fn register_condition(&self, condition_id: &str, condition: Condition) -> Result<()> {
        if condition_id.trim().is_empty() {
            return Err(CanvasRuntimeError::Validation(
                "condition id must not be empty".to_string(),
            ));
        }
        self.conditions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(condition_id.to_string(), condition);
        Ok(())
    }

    pub fn unregister_condition(&self, condition_id: &str) -> bool {
        self.conditions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(condition_id)
            .is_some()
    }

    /// Evaluate a named condition; unknown names evaluate to `false`
    pub fn evaluate_named_condition(&self, condition_id: &str, context: &EvaluationContext) -> bool {
        let condition = self
            .conditions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(condition_id)
            .cloned();
        match condition {
            Some(condition) => self.evaluator.evaluate(&condition, context),
            None => {
                debug!(condition_id, "unknown named condition");
                false
            }
        }
    }

    /// Ids of the registered named conditions, sorted
    pub fn get_registered_conditions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .conditions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, ComparisonOperator, RuleType};
    use chrono::Utc;
    use serde_json::json;

    fn context(value: serde_json::Value) -> EvaluationContext {
        EvaluationContext::from_value(value, Utc::now())
    }

    fn hot_rule(id: &str, priority: i32) -> BehaviorRule {
        BehaviorRule::new(id, RuleType::Safety)
            .with_condition(Condition::threshold("temperature", ComparisonOperator::GreaterThan, 30.0))
            .with_priority(priority)
    }

    #[test]
    fn test_priority_order_with_stable_ties() {
        let engine = RuleEngine::new();
        engine
            .register_rule(
                BehaviorRule::new("R1", RuleType::Safety)
                    .with_condition(Condition::threshold("temperature", ComparisonOperator::GreaterThan, 30.0))
                    .with_priority(2),
            )
            .unwrap();
        engine
            .register_rule(
                BehaviorRule::new("R2", RuleType::Operational)
                    .with_condition(Condition::equals("status", json!("active")))
                    .with_priority(1),
            )
            .unwrap();
        engine.register_rule(hot_rule("R3", 2)).unwrap();
        engine.register_rule(hot_rule("R4", 5)).unwrap();

        let matches = engine.evaluate_rules("ahu-1", &context(json!({"temperature": 35, "status": "active"})));
        let ids: Vec<&str> = matches.iter().map(|m| m.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["R4", "R1", "R3", "R2"]);
        assert!(matches.windows(2).all(|w| w[0].priority >= w[1].priority));
    }

    #[test]
    fn test_re_registration_replaces_in_place() {
        let engine = RuleEngine::new();
        engine.register_rule(hot_rule("a", 1)).unwrap();
        engine.register_rule(hot_rule("b", 1)).unwrap();
        engine
            .register_rule(hot_rule("a", 9).with_action(Action::log("replaced")))
            .unwrap();

        let rules = engine.get_registered_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "a");
        assert_eq!(rules[0].priority, 9);
        assert_eq!(rules[0].actions.len(), 1);
    }

    #[test]
    fn test_disabled_and_unregistered_rules_do_not_match() {
        let engine = RuleEngine::new();
        engine.register_rule(hot_rule("a", 1)).unwrap();
        engine.register_rule(hot_rule("b", 1)).unwrap();
        let ctx = context(json!({"temperature": 40}));

        engine.set_rule_enabled("a", false).unwrap();
        assert!(engine.unregister_rule("b"));
        assert!(!engine.unregister_rule("b"));
        assert!(engine.evaluate_rules("x", &ctx).is_empty());

        engine.set_rule_enabled("a", true).unwrap();
        assert_eq!(engine.evaluate_rules("x", &ctx).len(), 1);

        assert!(matches!(
            engine.set_rule_enabled("missing", true),
            Err(CanvasRuntimeError::NotFound { kind: "rule", .. })
        ));
    }

    #[test]
    fn test_all_conditions_must_hold() {
        let engine = RuleEngine::new();
        engine
            .register_rule(hot_rule("a", 1).with_condition(Condition::equals("status", json!("active"))))
            .unwrap();

        assert!(engine.evaluate_rules("x", &context(json!({"temperature": 40, "status": "idle"}))).is_empty());
        assert_eq!(engine.evaluate_rules("x", &context(json!({"temperature": 40, "status": "active"}))).len(), 1);
    }

    #[test]
    fn test_scoping_by_element_and_type() {
        let engine = RuleEngine::new();
        engine.register_rule(hot_rule("only-ahu-1", 1).for_elements(&["ahu-1"])).unwrap();
        engine.register_rule(hot_rule("pumps", 1).for_element_types(&["pump"])).unwrap();

        let ahu = context(json!({"temperature": 40, "element_type": "air_handler"}));
        let pump = context(json!({"temperature": 40, "element_type": "pump"}));

        assert_eq!(engine.evaluate_rules("ahu-1", &ahu)[0].rule_id, "only-ahu-1");
        assert!(engine.evaluate_rules("ahu-2", &ahu).is_empty());
        assert_eq!(engine.evaluate_rules("pump-7", &pump)[0].rule_id, "pumps");
    }

    #[test]
    fn test_empty_rule_id_is_rejected() {
        let engine = RuleEngine::new();
        assert!(matches!(
            engine.register_rule(hot_rule(" ", 1)),
            Err(CanvasRuntimeError::Validation(_))
        ));
        assert_eq!(engine.rule_count(), 0);
    }

    #[test]
    fn test_named_conditions() {
        let engine = RuleEngine::new();
        engine
            .register_condition("overheated", Condition::threshold("temperature", ComparisonOperator::GreaterOrEqual, 80.0))
            .unwrap();

        assert!(engine.evaluate_named_condition("overheated", &context(json!({"temperature": 80}))));
        assert!(!engine.evaluate_named_condition("overheated", &context(json!({"temperature": 20}))));
        assert!(!engine.evaluate_named_condition("unknown", &context(json!({}))));
        assert_eq!(engine.get_registered_conditions(), vec!["overheated".to_string()]);
        assert!(engine.unregister_condition("overheated"));
    }
}
