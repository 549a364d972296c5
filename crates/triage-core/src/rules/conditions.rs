use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::context::RuleEvaluationContext;

/// Nesting limit for submitted condition trees.
pub const MAX_GROUP_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOperator {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: GroupOperator,
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Leaf(Condition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Subject,
    ConversationSubject,
    Body,
    SenderEmail,
    SenderName,
    SenderDomain,
    ToEmail,
    ToName,
    CcEmail,
    CcName,
    BccEmail,
    BccName,
    RecipientEmail,
    AttachmentFilename,
    Header,
    SenderInContacts,
    SenderDomainInList,
}

impl ConditionField {
    /// Fields that only make sense with `in_list`.
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            ConditionField::SenderInContacts | ConditionField::SenderDomainInList
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    InList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field: ConditionField,
    pub match_type: MatchType,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub negate: bool,
    /// Header name, required when `field` is `header`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("invalid condition json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("value for {field:?} in_list must be a JSON array of strings: {source}")]
    MalformedList {
        field: ConditionField,
        source: serde_json::Error,
    },
    #[error("field {0:?} requires match type in_list")]
    MembershipRequiresInList(ConditionField),
    #[error("header condition requires a header name")]
    MissingHeaderName,
    #[error("condition tree nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("condition tree is required")]
    Missing,
}

/// Decode and strictly validate a condition tree submitted by a client.
pub fn parse_condition_group(value: &Value) -> Result<ConditionGroup, ConditionError> {
    if value.is_null() {
        return Err(ConditionError::Missing);
    }
    let group: ConditionGroup = serde_json::from_value(value.clone())?;
    validate_group(&group)?;
    Ok(group)
}

pub fn validate_group(group: &ConditionGroup) -> Result<(), ConditionError> {
    validate_group_at(group, 1)
}

fn validate_group_at(group: &ConditionGroup, depth: usize) -> Result<(), ConditionError> {
    if depth > MAX_GROUP_DEPTH {
        return Err(ConditionError::TooDeep(MAX_GROUP_DEPTH));
    }
    for child in &group.conditions {
        match child {
            ConditionNode::Group(nested) => validate_group_at(nested, depth + 1)?,
            ConditionNode::Leaf(condition) => validate_condition(condition)?,
        }
    }
    Ok(())
}

pub fn validate_condition(condition: &Condition) -> Result<(), ConditionError> {
    if condition.field.is_membership() && condition.match_type != MatchType::InList {
        return Err(ConditionError::MembershipRequiresInList(condition.field));
    }

    if condition.field == ConditionField::Header
        && condition
            .header
            .as_deref()
            .map(str::trim)
            .is_none_or(str::is_empty)
    {
        return Err(ConditionError::MissingHeaderName);
    }

    match condition.match_type {
        MatchType::Regex => {
            build_regex(&condition.value).map_err(|source| ConditionError::InvalidRegex {
                pattern: condition.value.clone(),
                source,
            })?;
        }
        MatchType::InList => {
            serde_json::from_str::<Vec<String>>(&condition.value).map_err(|source| {
                ConditionError::MalformedList {
                    field: condition.field,
                    source,
                }
            })?;
        }
        _ => {}
    }
    Ok(())
}

fn build_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

#[derive(Debug, Clone)]
enum TextTest {
    Equals(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    /// `None` when the stored pattern failed to compile; never matches.
    Regex(Option<Regex>),
}

#[derive(Debug, Clone)]
pub struct TextCondition {
    field: ConditionField,
    header: Option<String>,
    test: TextTest,
    negate: bool,
}

#[derive(Debug, Clone)]
pub struct MembershipCondition {
    field: ConditionField,
    header: Option<String>,
    allowed_values: HashSet<String>,
    negate: bool,
}

/// A leaf decoded once at load time. Malformed stored data degrades here to
/// conditions that never match, so evaluation itself cannot fail.
#[derive(Debug, Clone)]
pub enum CompiledCondition {
    Text(TextCondition),
    Membership(MembershipCondition),
}

impl CompiledCondition {
    pub fn compile(condition: &Condition) -> Self {
        let header = condition.header.clone();
        let negate = condition.negate;
        let lowered = condition.value.to_lowercase();

        let test = match condition.match_type {
            MatchType::InList => {
                let allowed_values = match serde_json::from_str::<Vec<String>>(&condition.value) {
                    Ok(values) => values.iter().map(|value| value.to_lowercase()).collect(),
                    Err(err) => {
                        warn!(
                            field = ?condition.field,
                            error = %err,
                            "malformed membership list, treating as empty"
                        );
                        HashSet::new()
                    }
                };
                return CompiledCondition::Membership(MembershipCondition {
                    field: condition.field,
                    header,
                    allowed_values,
                    negate,
                });
            }
            MatchType::Equals => TextTest::Equals(lowered),
            MatchType::Contains => TextTest::Contains(lowered),
            MatchType::StartsWith => TextTest::StartsWith(lowered),
            MatchType::EndsWith => TextTest::EndsWith(lowered),
            MatchType::Regex => match build_regex(&condition.value) {
                Ok(regex) => TextTest::Regex(Some(regex)),
                Err(err) => {
                    warn!(
                        pattern = %condition.value,
                        error = %err,
                        "invalid regex in condition, treating as non-match"
                    );
                    TextTest::Regex(None)
                }
            },
        };

        CompiledCondition::Text(TextCondition {
            field: condition.field,
            header,
            test,
            negate,
        })
    }

    pub fn evaluate(&self, ctx: &RuleEvaluationContext) -> bool {
        match self {
            CompiledCondition::Text(text) => {
                let values = project(text.field, text.header.as_deref(), ctx);
                let matched = values.iter().any(|value| text.test.matches(value));
                matched != text.negate
            }
            CompiledCondition::Membership(membership) => {
                let values = project(membership.field, membership.header.as_deref(), ctx);
                let matched = values
                    .iter()
                    .any(|value| membership.allowed_values.contains(&value.to_lowercase()));
                matched != membership.negate
            }
        }
    }
}

impl TextTest {
    fn matches(&self, value: &str) -> bool {
        match self {
            TextTest::Regex(Some(regex)) => regex.is_match(value),
            TextTest::Regex(None) => false,
            TextTest::Equals(pattern) => value.to_lowercase() == *pattern,
            TextTest::Contains(pattern) => value.to_lowercase().contains(pattern.as_str()),
            TextTest::StartsWith(pattern) => value.to_lowercase().starts_with(pattern.as_str()),
            TextTest::EndsWith(pattern) => value.to_lowercase().ends_with(pattern.as_str()),
        }
    }
}

/// Values of `field` in the context. Multi-valued fields yield one entry per value
/// and absent scalars yield nothing.
fn project<'a>(
    field: ConditionField,
    header: Option<&'a str>,
    ctx: &'a RuleEvaluationContext,
) -> Vec<&'a str> {
    match field {
        ConditionField::Subject => ctx.subject.as_deref().into_iter().collect(),
        ConditionField::ConversationSubject => {
            ctx.conversation_subject.as_deref().into_iter().collect()
        }
        ConditionField::Body => ctx.body_text.as_deref().into_iter().collect(),
        ConditionField::SenderEmail | ConditionField::SenderInContacts => {
            ctx.sender_email.as_deref().into_iter().collect()
        }
        ConditionField::SenderName => ctx.sender_name.as_deref().into_iter().collect(),
        ConditionField::SenderDomain | ConditionField::SenderDomainInList => {
            ctx.sender_domain().into_iter().collect()
        }
        ConditionField::ToEmail => ctx.to.iter().map(|a| a.email.as_str()).collect(),
        ConditionField::ToName => ctx.to.iter().filter_map(|a| a.name.as_deref()).collect(),
        ConditionField::CcEmail => ctx.cc.iter().map(|a| a.email.as_str()).collect(),
        ConditionField::CcName => ctx.cc.iter().filter_map(|a| a.name.as_deref()).collect(),
        ConditionField::BccEmail => ctx.bcc.iter().map(|a| a.email.as_str()).collect(),
        ConditionField::BccName => ctx.bcc.iter().filter_map(|a| a.name.as_deref()).collect(),
        ConditionField::RecipientEmail => ctx.recipients().map(|a| a.email.as_str()).collect(),
        ConditionField::AttachmentFilename => {
            ctx.attachment_filenames.iter().map(String::as_str).collect()
        }
        ConditionField::Header => match header {
            Some(name) => ctx.header_values(name).collect(),
            None => Vec::new(),
        },
    }
}

#[derive(Debug, Clone)]
pub enum CompiledNode {
    Condition(CompiledCondition),
    Group(CompiledGroup),
}

#[derive(Debug, Clone)]
pub struct CompiledGroup {
    operator: GroupOperator,
    children: Vec<CompiledNode>,
}

impl CompiledGroup {
    pub fn compile(group: &ConditionGroup) -> Self {
        let children = group
            .conditions
            .iter()
            .map(|child| match child {
                ConditionNode::Group(nested) => CompiledNode::Group(CompiledGroup::compile(nested)),
                ConditionNode::Leaf(condition) => {
                    CompiledNode::Condition(CompiledCondition::compile(condition))
                }
            })
            .collect();
        Self {
            operator: group.operator,
            children,
        }
    }

    /// Empty AND is true, empty OR is false. Children run in declared order.
    pub fn evaluate(&self, ctx: &RuleEvaluationContext) -> bool {
        match self.operator {
            GroupOperator::And => self.children.iter().all(|child| child.evaluate(ctx)),
            GroupOperator::Or => self.children.iter().any(|child| child.evaluate(ctx)),
        }
    }
}

impl CompiledNode {
    fn evaluate(&self, ctx: &RuleEvaluationContext) -> bool {
        match self {
            CompiledNode::Condition(condition) => condition.evaluate(ctx),
            CompiledNode::Group(group) => group.evaluate(ctx),
        }
    }
}

pub fn evaluate_condition(condition: &Condition, ctx: &RuleEvaluationContext) -> bool {
    CompiledCondition::compile(condition).evaluate(ctx)
}

pub fn evaluate_group(group: &ConditionGroup, ctx: &RuleEvaluationContext) -> bool {
    CompiledGroup::compile(group).evaluate(ctx)
}
