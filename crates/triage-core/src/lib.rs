pub mod config;
pub mod containers;
pub mod conversations;
pub mod db;
pub mod jobs;
pub mod messages;
pub mod migrations;
pub mod rules;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Config, RulesConfig};
pub use containers::{Container, ContainerError, ContainerRepository};
pub use conversations::{Conversation, ConversationError, ConversationRepository};
pub use db::{Database, DbError};
pub use jobs::{
    ContainerScope, ItemRef, JobStatus, RuleApplicationJob, RuleApplicationJobRepository,
    RuleApplicationService, ServiceError,
};
pub use messages::{Message, MessageError, MessageRepository, NewMessage};
pub use migrations::run_migrations;
pub use telemetry::{TelemetryError, TelemetryGuard, init_telemetry};
