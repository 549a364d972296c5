use super::conditions::CompiledGroup;
use super::context::RuleEvaluationContext;
use super::types::{Rule, RuleMatch};

/// A rule with its condition tree decoded once for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    conditions: CompiledGroup,
}

impl CompiledRule {
    pub fn compile(rule: Rule) -> Self {
        let conditions = CompiledGroup::compile(&rule.conditions);
        Self { rule, conditions }
    }

    pub fn matches(&self, ctx: &RuleEvaluationContext) -> bool {
        self.conditions.evaluate(ctx)
    }

    pub fn to_match(&self) -> RuleMatch {
        RuleMatch::from(&self.rule)
    }
}

/// Enabled rules in priority order, ready for first-match-wins selection.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// `rules` must arrive in declaration order; that order breaks position ties.
    pub fn compile(rules: Vec<Rule>) -> Self {
        let mut rules: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|rule| rule.enabled)
            .map(CompiledRule::compile)
            .collect();
        // sort_by_key is stable
        rules.sort_by_key(|compiled| compiled.rule.position);
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|compiled| &compiled.rule)
    }

    /// First matching rule scoped to `container_id`. With no container the scope
    /// filter is skipped.
    pub fn select(
        &self,
        ctx: &RuleEvaluationContext,
        container_id: Option<i64>,
    ) -> Option<RuleMatch> {
        self.rules
            .iter()
            .filter(|compiled| match container_id {
                Some(id) => compiled.rule.applies_to_container(id),
                None => true,
            })
            .find(|compiled| compiled.matches(ctx))
            .map(CompiledRule::to_match)
    }
}

pub fn select_rule(
    rules: Vec<Rule>,
    ctx: &RuleEvaluationContext,
    container_id: Option<i64>,
) -> Option<RuleMatch> {
    RuleSet::compile(rules).select(ctx, container_id)
}
