//! Configuration errors
//!
//! Error codes are stable identifiers that callers match on.
//! Do not rename them; add new codes instead.

/// Errors raised while assembling or validating connection configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A mandatory setting (account, username) is absent
    #[error("Missing Snowflake config: set {key} ({field} is required)")]
    MissingField { field: &'static str, key: &'static str },

    /// The active strategy has no usable credential material
    #[error("Missing Snowflake auth: {0}")]
    MissingCredentials(String),

    /// The authenticator selector holds a value we do not understand
    #[error("Unrecognized authenticator '{0}' (expected SNOWFLAKE, SNOWFLAKE_JWT, EXTERNALBROWSER or USERNAME_PASSWORD_MFA)")]
    UnknownAuthenticator(String),

    /// A setting is present but cannot be parsed
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// Private key material could not be read or decoded
    #[error("Private key error: {0}")]
    KeyMaterial(String),

    /// The requested capability is not available in this build
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl ConfigError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "CONFIG_MISSING_FIELD",
            Self::MissingCredentials(_) => "CONFIG_MISSING_CREDENTIALS",
            Self::UnknownAuthenticator(_) => "CONFIG_UNKNOWN_AUTHENTICATOR",
            Self::InvalidValue { .. } => "CONFIG_INVALID_VALUE",
            Self::KeyMaterial(_) => "CONFIG_KEY_MATERIAL",
            Self::Unsupported(_) => "CONFIG_UNSUPPORTED",
            Self::IoError(_) => "CONFIG_IO",
            Self::ParseError(_) => "CONFIG_PARSE",
        }
    }
}
