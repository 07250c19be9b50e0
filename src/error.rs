//! Error taxonomy for the controller core.
//!
//! Configuration and not-implemented errors are fatal at startup. Everything
//! else is a runtime condition: logged, converted into state the status
//! snapshot exposes, and never allowed to take the scheduler down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Schema violation, missing primary device, bounds violation, or
    /// inconsistent adaptation periods. Carries every violation found.
    #[error("configuration invalid: {}", issues.join("; "))]
    Configuration { issues: Vec<String> },

    /// Connect or verify failed after the retry budget.
    #[error("device {address} unreachable: {reason}")]
    DeviceUnreachable { address: String, reason: String },

    /// A command verified as the opposite of what was requested.
    #[error("device {address} still {actual} after {requested} was requested")]
    DeviceStateMismatch {
        address: String,
        requested: &'static str,
        actual: &'static str,
    },

    /// Transient weather fetch failure.
    #[error("weather feed unavailable: {0}")]
    WeatherUnavailable(String),

    /// Postcode with no entry in the embedded location table.
    #[error("postcode {0} has no known location")]
    LocationUnknown(String),

    /// Strategy recognized by the schema but not implemented.
    #[error("{0} scheduling is not implemented")]
    NotImplemented(&'static str),

    /// Control command received while shutdown is in progress.
    #[error("controller is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn configuration(issues: Vec<String>) -> Self {
        Error::Configuration { issues }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_lists_every_issue() {
        let err = Error::configuration(vec!["a is missing".into(), "b out of range".into()]);
        let msg = err.to_string();
        assert!(msg.contains("a is missing"));
        assert!(msg.contains("b out of range"));
    }

    #[test]
    fn mismatch_message_names_both_states() {
        let err = Error::DeviceStateMismatch {
            address: "10.0.0.7".into(),
            requested: "ON",
            actual: "OFF",
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.7"));
        assert!(msg.contains("ON"));
        assert!(msg.contains("OFF"));
    }
}
