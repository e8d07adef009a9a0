//! Error types for the NodePort allocator

use thiserror::Error;

/// Main error type for allocator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid or inconsistent configuration; fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Port lies outside the resolved range
    #[error("port {port} is outside the allowed range [{start}, {end}]")]
    OutOfRange {
        /// The offending port
        port: i32,
        /// First port of the range
        start: i32,
        /// Last port of the range
        end: i32,
    },

    /// Port is already allocated to another Service
    #[error("port {0} is already in use")]
    PortInUse(i32),

    /// Auto-allocation found no free port in the range
    #[error("port range {0} is exhausted")]
    RangeFull(String),

    /// Range used before its bitmap was loaded from storage
    #[error("port range {0} is not initialized")]
    Uninitialized(String),

    /// Optimistic-concurrency retry budget exhausted; the caller may retry
    #[error("storage conflict not resolved after {0} attempts")]
    Conflict(u32),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Some ports of a deleted Service could not be released; non-fatal
    #[error("failed to release {0} port(s)")]
    ReleaseIncomplete(usize),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error denies an admission but leaves state untouched
    ///
    /// Used by the webhook to distinguish user-fixable denials from
    /// infrastructure failures when choosing log severity.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::OutOfRange { .. } | Self::PortInUse(_) | Self::RangeFull(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: admission denials carry enough context for the user to act
    ///
    /// When a Service requests a port the allocator cannot grant, the denial
    /// message names the port and, where relevant, the range bounds, so the
    /// user can fix the manifest without consulting the operator.
    #[test]
    fn story_denial_messages_name_the_port() {
        let err = Error::OutOfRange {
            port: 32000,
            start: 31500,
            end: 31999,
        };
        assert!(err.to_string().contains("32000"));
        assert!(err.to_string().contains("[31500, 31999]"));

        let err = Error::PortInUse(31500);
        assert!(err.to_string().contains("31500"));
        assert!(err.to_string().contains("in use"));

        let err = Error::RangeFull("dev".to_string());
        assert!(err.to_string().contains("dev"));
        assert!(err.to_string().contains("exhausted"));
    }

    /// Story: error categorization drives webhook logging
    ///
    /// Denials caused by user requests (port taken, range full, out of range)
    /// are expected traffic; storage and API failures are not.
    #[test]
    fn story_denials_are_distinguished_from_failures() {
        assert!(Error::PortInUse(31500).is_denial());
        assert!(Error::RangeFull("dev".into()).is_denial());
        assert!(Error::OutOfRange {
            port: 1,
            start: 2,
            end: 3
        }
        .is_denial());

        assert!(!Error::Conflict(3).is_denial());
        assert!(!Error::config("bad").is_denial());
        assert!(!Error::serialization("bad").is_denial());
    }

    /// Story: helper constructors accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let range = "prod";
        let err = Error::config(format!("default range {} not found", range));
        assert!(err.to_string().contains("prod"));

        let err = Error::serialization("static message");
        assert!(err.to_string().contains("static message"));
    }

    #[test]
    fn test_conflict_reports_attempts() {
        let err = Error::Conflict(3);
        assert!(err.to_string().contains("3 attempts"));
    }
}
