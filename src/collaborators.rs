//! Contracts for the parsers and the persistence API the processor drives.
//!
//! Neither side is implemented here: the manifest parsers and the remote
//! datastore live outside this crate and are injected into
//! [`EventProcessor`](crate::EventProcessor).

use crate::entity::{
    AtlasManifest, FoilHole, FoilHoleManifest, Grid, GridSquare, GridSquareManifest,
    GridSquareMetadata, Micrograph, MicrographManifest, SessionManifest,
};
use std::path::Path;
use thiserror::Error;

/// Why a manifest could not be turned into field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Content is present but not valid for its shape.
    Malformed,
    /// The file a manifest refers to (or the manifest itself) does not exist.
    MissingFile,
    /// File is truncated, most likely still being written by EPU.
    Incomplete,
    /// Read failed for a reason other than absence.
    Io,
}

impl ParseErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseErrorKind::Malformed => "malformed",
            ParseErrorKind::MissingFile => "missing_file",
            ParseErrorKind::Incomplete => "incomplete",
            ParseErrorKind::Io => "io",
        }
    }
}

/// Error raised by a [`ManifestParser`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{} parse error: {message}", kind.as_str())]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::Malformed, message)
    }

    pub fn missing(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::MissingFile, message)
    }

    pub fn incomplete(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::Incomplete, message)
    }
}

/// Error raised by a [`Datastore`] call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatastoreError {
    /// Remote API answered with a non-success status.
    #[error("api returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("api request timed out")]
    Timeout,
    #[error("api connection failed: {0}")]
    Connection(String),
    /// Request was refused before reaching the API (validation, serialization).
    #[error("api request rejected: {0}")]
    Rejected(String),
}

impl DatastoreError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        DatastoreError::Http {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DatastoreError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Turns EPU files into typed field values.
pub trait ManifestParser: Send + Sync {
    fn parse_session_manifest(&self, path: &Path) -> Result<SessionManifest, ParseError>;
    fn parse_atlas_manifest(&self, path: &Path) -> Result<AtlasManifest, ParseError>;
    fn parse_gridsquare_metadata(&self, path: &Path) -> Result<GridSquareMetadata, ParseError>;
    fn parse_gridsquare_manifest(&self, path: &Path) -> Result<GridSquareManifest, ParseError>;
    fn parse_foilhole_manifest(&self, path: &Path) -> Result<FoilHoleManifest, ParseError>;
    fn parse_micrograph_manifest(&self, path: &Path) -> Result<MicrographManifest, ParseError>;
}

/// Synchronous persistence API. A 404 from a child create means the parent is
/// not yet visible remotely.
pub trait Datastore: Send + Sync {
    fn create_grid(&self, grid: &Grid) -> Result<(), DatastoreError>;
    fn update_grid(&self, grid: &Grid) -> Result<(), DatastoreError>;
    /// Signals that atlas positions have been applied to the grid.
    fn grid_registered(&self, grid: &Grid) -> Result<(), DatastoreError>;
    fn create_gridsquare(&self, square: &GridSquare) -> Result<(), DatastoreError>;
    fn update_gridsquare(&self, square: &GridSquare) -> Result<(), DatastoreError>;
    fn create_foilholes(&self, gridsquare_id: &str, holes: &[FoilHole])
        -> Result<(), DatastoreError>;
    fn create_foilhole(&self, hole: &FoilHole) -> Result<(), DatastoreError>;
    fn update_foilhole(&self, hole: &FoilHole) -> Result<(), DatastoreError>;
    fn create_micrograph(&self, micrograph: &Micrograph) -> Result<(), DatastoreError>;
    fn update_micrograph(&self, micrograph: &Micrograph) -> Result<(), DatastoreError>;
}
