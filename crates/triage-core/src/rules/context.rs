use serde::{Deserialize, Serialize};

/// One mailbox in a recipient list or the sender slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Address {
    pub fn new(email: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            email: email.into(),
            name: name.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Flattened, read-only view of a single message as seen by the condition
/// evaluator. Built once per message by the store; the engine never mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleEvaluationContext {
    pub subject: Option<String>,
    pub conversation_subject: Option<String>,
    pub body_text: Option<String>,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub attachment_filenames: Vec<String>,
    pub headers: Vec<Header>,
}

impl RuleEvaluationContext {
    pub fn sender_domain(&self) -> Option<&str> {
        self.sender_email.as_deref().and_then(extract_domain)
    }

    /// Header values whose name matches case-insensitively, in message order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }
}

pub(crate) fn extract_domain(email: &str) -> Option<&str> {
    let at_index = email.rfind('@')?;
    let domain = &email[at_index + 1..];
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}
