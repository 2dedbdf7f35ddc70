//! Typed failures of the scroll controller.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScrollError {
    /// Camera missing or permission denied.
    #[error("camera access failed: {0}")]
    CameraAccess(String),

    /// Landmark helper could not be started or never became ready.
    #[error("landmark model failed to initialize: {0}")]
    ModelInit(String),

    /// A single frame could not be processed; the loop keeps going.
    #[error("detection failed for this frame: {0}")]
    Detection(String),

    /// The landmark helper went away mid-session.
    #[error("landmark source lost: {0}")]
    SourceLost(String),

    #[error("scroll sink failed: {0}")]
    Sink(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ScrollError {
    /// Whether the error ends the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScrollError::CameraAccess(_) | ScrollError::ModelInit(_) | ScrollError::SourceLost(_)
        )
    }
}

pub type ScrollResult<T> = std::result::Result<T, ScrollError>;
