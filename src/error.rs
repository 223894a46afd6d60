//! Crate-wide error type.
//!
//! Mirrors the shape of a hand-rolled hypervisor error enum: one variant
//! per failure kind named in spec §7, a manual `Display` impl, no
//! `thiserror` at this layer (that's reserved for the CLI, see
//! `cli::CliError`).

use std::fmt;

/// Every fallible outcome the scheduling core can produce.
#[derive(Debug, Clone)]
pub enum SchedulerError {
    /// A subset or manager could not find enough physical/virtual capacity.
    NotEnoughResources { resource: String },
    /// `remove` was called for a VM the manager has no record of.
    DoesNotExist(String),
    /// A VM is present in some per-resource managers but not all.
    /// Logged, not fatal — reconciled on the next `iterate`.
    UnequalPresence(String),
    /// The hypervisor connector reports a VM that no longer exists.
    /// Always handled as a silent skip, never surfaced as an `Err`.
    ConsumerNotAlive(String),
    /// The hypervisor connector reported a failure verbatim.
    HypervisorFailure(String),
    /// A CSV trace line did not match the expected schema. Fatal during replay.
    TraceFormat(String),
    /// A required environment variable was missing or out of range at startup.
    ConfigMissing(String),
    /// A dispatcher→agent REST call failed (connect/read timeout, non-2xx,
    /// unparsable body).
    NodeUnreachable(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEnoughResources { resource } => {
                write!(f, "not enough resources: {resource}")
            }
            Self::DoesNotExist(name) => write!(f, "does not exist: {name}"),
            Self::UnequalPresence(name) => write!(f, "unequal presence: {name}"),
            Self::ConsumerNotAlive(name) => write!(f, "consumer not alive: {name}"),
            Self::HypervisorFailure(reason) => write!(f, "hypervisor failure: {reason}"),
            Self::TraceFormat(reason) => write!(f, "trace format error: {reason}"),
            Self::ConfigMissing(reason) => write!(f, "config missing: {reason}"),
            Self::NodeUnreachable(reason) => write!(f, "node unreachable: {reason}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
