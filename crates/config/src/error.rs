//! Error types for configuration loading.

use thiserror::Error;

/// Errors raised while reading the dispatcher configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A channel is configured but one of its mandatory values is absent.
    #[error("missing mandatory configuration [{envname}]")]
    MissingRequiredValue { envname: String },

    /// A value is present but cannot be parsed.
    #[error("invalid value [{value}] for [{envname}]: {reason}")]
    InvalidValue {
        envname: String,
        value: String,
        reason: String,
    },

    /// A base URL could not be parsed.
    #[error("baseurl parse error for service [{service}]: {source}")]
    InvalidUrl {
        service: String,
        #[source]
        source: url::ParseError,
    },

    /// Every channel is either unconfigured or rejected.
    #[error("no notification channel is configured, refusing to start")]
    NoChannels,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_value_display() {
        let err = ConfigError::MissingRequiredValue {
            envname: "CALLOUT_TWILIO_TOKEN".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "missing mandatory configuration [CALLOUT_TWILIO_TOKEN]"
        );
    }

    #[test]
    fn test_invalid_url_keeps_source() {
        let source = url::Url::parse("not a url").unwrap_err();
        let err = ConfigError::InvalidUrl {
            service: "slack".to_string(),
            source,
        };
        assert!(err.to_string().starts_with("baseurl parse error for service [slack]"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
