//! Protocol error types

use thiserror::Error;

/// Errors raised while interpreting USB wire data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A sub-descriptor's length runs past the declared total length,
    /// or is too small to ever advance the walk
    #[error("Corrupt descriptor at offset {offset}: bLength {length} with wTotalLength {total}")]
    CorruptDescriptor {
        offset: usize,
        length: usize,
        total: usize,
    },

    /// A descriptor is shorter than its standard layout requires
    #[error("{kind} descriptor too short: {length} bytes (need {needed})")]
    ShortDescriptor {
        kind: &'static str,
        length: usize,
        needed: usize,
    },

    /// The buffer does not start with a configuration descriptor header
    #[error("Invalid configuration descriptor header")]
    InvalidConfigHeader,

    /// wTotalLength claims more bytes than the buffer holds
    #[error("Truncated configuration: wTotalLength {declared}, only {available} bytes available")]
    TruncatedConfiguration { declared: usize, available: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::CorruptDescriptor {
            offset: 18,
            length: 40,
            total: 32,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("offset 18"));
        assert!(msg.contains("bLength 40"));
        assert!(msg.contains("wTotalLength 32"));
    }

    #[test]
    fn test_truncated_error() {
        let err = ProtocolError::TruncatedConfiguration {
            declared: 101,
            available: 9,
        };
        assert!(format!("{}", err).contains("101"));
    }
}
