//! Shared wire and policy types for the quill agent engine.
//!
//! This crate deliberately contains no I/O: it is the vocabulary spoken
//! between the turn engine, the safety classifier, and any front end that
//! embeds the engine.

pub mod models;
pub mod protocol;

pub use models::ContentItem;
pub use models::FunctionCallOutputPayload;
pub use models::ReasoningSummary;
pub use models::ResponseInputItem;
pub use models::ResponseItem;
pub use protocol::ApprovalPolicy;
pub use protocol::CommandConfirmation;
pub use protocol::ReviewDecision;
