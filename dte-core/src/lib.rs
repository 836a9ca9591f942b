//! Rust toolkit for Chilean SII electronic tax documents (DTE): building,
//! CAF stamping, XML-DSig signing, token handshake and SOAP upload.
//!
//! # Examples
//! ```rust
//! use dte_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Certification);
//! assert_eq!(config.env().endpoint_url(), "https://maullin.sii.cl/");
//! ```
pub mod api;
pub mod caf;
pub mod config;
pub mod credential;
pub mod document;

use thiserror::Error;

pub use api::{HandshakeError, SiiClient, SubmissionError};
pub use caf::{Authorization, AuthorizationParseError};
pub use config::{ConfigError, EnvironmentParseError};
pub use credential::{Credential, CredentialError};
pub use document::sign::SignatureError;
pub use document::stamp::StampError;
pub use document::DocumentError;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Credential(#[from] credential::CredentialError),
    #[error(transparent)]
    Authorization(#[from] caf::AuthorizationParseError),
    #[error(transparent)]
    Document(#[from] document::DocumentError),
    #[error(transparent)]
    Stamp(#[from] document::stamp::StampError),
    #[error(transparent)]
    Signature(#[from] document::sign::SignatureError),
    #[error(transparent)]
    Handshake(#[from] api::HandshakeError),
    #[error(transparent)]
    Submission(#[from] api::SubmissionError),
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::{
        api::{HandshakeError, SubmissionError},
        caf::AuthorizationParseError,
        config::ConfigError,
        credential::CredentialError,
        document::{sign::SignatureError, stamp::StampError, DocumentError},
    };

    #[test]
    fn error_conversions_cover_variants() {
        let err: Error = ConfigError::MissingVariable("BILLING_RUT").into();
        assert!(matches!(err, Error::Config(_)));

        let err: Error = CredentialError::MissingPrivateKey.into();
        assert!(matches!(err, Error::Credential(_)));

        let err: Error = AuthorizationParseError::MissingField("RSASK").into();
        assert!(matches!(err, Error::Authorization(_)));

        let err: Error = DocumentError::MissingLineItems.into();
        assert!(matches!(err, Error::Document(_)));

        let err: Error = StampError::MissingField("RUTEmisor").into();
        assert!(matches!(err, Error::Stamp(_)));

        let err: Error = SignatureError::TargetNotFound { id: "R1".into() }.into();
        assert!(matches!(err, Error::Signature(_)));

        let err: Error = HandshakeError::MissingElement {
            element: "SEMILLA",
            head: String::new(),
        }
        .into();
        assert!(matches!(err, Error::Handshake(_)));

        let err: Error = SubmissionError::NoTrackId {
            estado: None,
            glosa: None,
        }
        .into();
        assert!(matches!(err, Error::Submission(_)));
        assert!(err.to_string().contains("TRACKID"));
    }
}
