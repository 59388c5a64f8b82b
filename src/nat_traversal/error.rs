/**
 * nat_traversal/error.rs
 *
 * Error kinds shared across the traversal core
 */

use std::fmt;

/// Traversal failure kinds
#[derive(Debug)]
pub enum TraversalError {
    /// Socket-level failure: bind, resolve, dial or send
    NetworkUnavailable(String),
    /// No response within a deadline
    Timeout(String),
    /// Peer or server spoke something unexpected
    ProtocolViolation(String),
    /// Signalling channel operation failed
    SignallingUnavailable(String),
    /// Configuration rejected before any network activity
    InvalidConfig(String),
    /// Every connection strategy failed
    AllStrategiesExhausted,
}

impl fmt::Display for TraversalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraversalError::NetworkUnavailable(e) => write!(f, "Network unavailable: {}", e),
            TraversalError::Timeout(e) => write!(f, "Timed out: {}", e),
            TraversalError::ProtocolViolation(e) => write!(f, "Protocol violation: {}", e),
            TraversalError::SignallingUnavailable(e) => write!(f, "Signalling unavailable: {}", e),
            TraversalError::InvalidConfig(e) => write!(f, "Invalid configuration: {}", e),
            TraversalError::AllStrategiesExhausted => {
                write!(f, "All connection strategies exhausted")
            }
        }
    }
}

impl std::error::Error for TraversalError {}

pub type Result<T> = std::result::Result<T, TraversalError>;
