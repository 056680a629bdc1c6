use serde::Deserialize;
use serde::Serialize;
use strum::Display;

/// How eagerly the engine may run model-proposed commands without asking.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Only commands on the read-only allowlist are auto-approved. Everything
    /// else asks the user.
    #[default]
    Suggest,

    /// Read-only commands plus patches confined to the writable roots are
    /// auto-approved; other commands ask the user.
    AutoEdit,

    /// Everything is auto-approved, but commands and writes must run inside a
    /// platform sandbox.
    FullAuto,
}

/// The user's answer to an approval prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Run this command, once.
    Approved,

    /// Run this command and auto-approve identical argv for the rest of the
    /// session.
    ApprovedForSession,

    /// The user wants the command explained before deciding; the engine asks
    /// again after producing an explanation.
    Explain,

    /// Skip this command but keep the turn going.
    #[default]
    Denied,

    /// Stop the whole run; nothing further executes until the next user turn.
    Abort,
}

/// Full response from the approval prompt, including an optional free-form
/// note the user typed when denying.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandConfirmation {
    pub decision: ReviewDecision,
    pub custom_deny_message: Option<String>,
}
