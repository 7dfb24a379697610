//! Errors raised by the interpreter bridge.

use std::fmt;

/// Error type for bridge operations
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Missing configuration, unresolvable class or factory, setup script failure
    Configuration(String),
    /// A script method raised, was absent, or returned something unusable
    Invocation { method: String, message: String },
    /// Instance used outside its bound lifetime, or teardown with live bindings
    Binding(String),
}

impl BridgeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        BridgeError::Configuration(message.into())
    }

    pub fn invocation(method: impl Into<String>, message: impl fmt::Display) -> Self {
        BridgeError::Invocation {
            method: method.into(),
            message: message.to_string(),
        }
    }

    pub fn binding(message: impl Into<String>) -> Self {
        BridgeError::Binding(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, BridgeError::Configuration(_))
    }

    pub fn is_invocation(&self) -> bool {
        matches!(self, BridgeError::Invocation { .. })
    }

    pub fn is_binding(&self) -> bool {
        matches!(self, BridgeError::Binding(_))
    }

    /// The interpreter's message (or the configuration/binding description)
    pub fn message(&self) -> &str {
        match self {
            BridgeError::Configuration(msg) | BridgeError::Binding(msg) => msg,
            BridgeError::Invocation { message, .. } => message,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            BridgeError::Invocation { method, message } => {
                write!(f, "Invocation of '{}' failed: {}", method, message)
            }
            BridgeError::Binding(msg) => write!(f, "Binding error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_method() {
        let err = BridgeError::invocation("map", "boom");
        assert_eq!(err.to_string(), "Invocation of 'map' failed: boom");
        assert!(err.is_invocation());
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn test_kind_predicates() {
        assert!(BridgeError::configuration("x").is_configuration());
        assert!(BridgeError::binding("x").is_binding());
        assert!(!BridgeError::binding("x").is_configuration());
    }
}
