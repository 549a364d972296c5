pub mod actions;
pub mod conditions;
pub mod context;
pub mod repositories;
pub mod selector;
pub mod types;
pub mod validation;

pub use actions::{ActionConfigError, ActionError, RuleAction, apply_match};
pub use conditions::{
    CompiledCondition, CompiledGroup, Condition, ConditionError, ConditionField, ConditionGroup,
    ConditionNode, GroupOperator, MatchType, evaluate_condition, evaluate_group,
    parse_condition_group,
};
pub use context::{Address, Header, RuleEvaluationContext};
pub use repositories::{RuleError, RuleRepository};
pub use selector::{CompiledRule, RuleSet, select_rule};
pub use types::{ActionType, NewRule, Rule, RuleMatch, RulePatch, RulePosition};
pub use validation::RuleValidationError;
