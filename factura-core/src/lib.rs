//! Rust toolkit for SUNAT (Peru) electronic invoicing: UBL 2.1 assembly,
//! enveloped XML-DSig signing, ISO-8859-1 rendering and billService submission.
//!
//! # Examples
//! ```rust
//! use factura_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Beta);
//! # let _ = config;
//! ```
pub mod config;
pub mod invoice;
pub mod pipeline;
pub mod transport;

use thiserror::Error;

pub use invoice::encoding::TranscodeError;
pub use invoice::{BuildError, SigningError};
pub use transport::{ExtractionError, TransportError};

/// Processing stage an [`Error`] comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Build,
    Signing,
    Transcode,
    Transport,
    Extraction,
}

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),
    #[error("transcoding failed: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("receipt extraction failed: {0}")]
    Extraction(ExtractionError),
}

// A fault is the remote rejecting the exchange, whichever layer spots it.
impl From<ExtractionError> for Error {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::Fault { code, message } => {
                Error::Transport(TransportError::Fault { code, message })
            }
            other => Error::Extraction(other),
        }
    }
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::Build(_) => Stage::Build,
            Error::Signing(_) => Stage::Signing,
            Error::Transcode(_) => Stage::Transcode,
            Error::Transport(_) => Stage::Transport,
            Error::Extraction(_) => Stage::Extraction,
        }
    }

    /// True when the document was fine but the remote side failed or rejected it.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self.stage(), Stage::Transport | Stage::Extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::archive::ArchiveError;

    #[test]
    fn error_conversions_cover_variants() {
        let err: Error = BuildError::NoLineItems.into();
        assert!(matches!(err, Error::Build(_)));
        assert_eq!(err.stage(), Stage::Build);
        assert_eq!(err.to_string(), "build failed: invoice has no line items");

        let err: Error = SigningError::KeyMismatch.into();
        assert!(matches!(err, Error::Signing(_)));
        assert!(!err.is_remote_failure());

        let err: Error = TranscodeError::Render("c14n".into()).into();
        assert_eq!(err.stage(), Stage::Transcode);

        let err: Error = TransportError::Archive(ArchiveError::NoXmlEntry).into();
        assert!(matches!(err, Error::Transport(TransportError::Archive(_))));
        assert!(err.is_remote_failure());

        let err: Error = ExtractionError::MissingPayload.into();
        assert!(matches!(err, Error::Extraction(ExtractionError::MissingPayload)));
        assert!(err.is_remote_failure());
    }

    #[test]
    fn extracted_fault_is_reported_as_transport_fault() {
        let err: Error = ExtractionError::Fault {
            code: "soap-env:Client.0111".into(),
            message: "No tiene el perfil para enviar comprobantes electronicos".into(),
        }
        .into();
        match &err {
            Error::Transport(TransportError::Fault { code, message }) => {
                assert_eq!(code, "soap-env:Client.0111");
                assert!(message.starts_with("No tiene el perfil"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.stage(), Stage::Transport);
    }
}
