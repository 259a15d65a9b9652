//! Error type shared by document creation and updates.

use tower_lsp::lsp_types::Position;

use crate::document::DocumentFormat;

/// Errors surfaced by [`Document::create`](crate::Document::create) and
/// [`Document::update`](crate::Document::update).
///
/// Every variant is reported before the document is touched, so a failed
/// update leaves the previous tree and text in place.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed op stream at op {op}: {message}")]
    MalformedDelta { op: usize, message: String },

    #[error("malformed op stream JSON: {0}")]
    DeltaJson(#[from] serde_json::Error),

    #[error("malformed USFM at {}:{}: {message}", .position.line + 1, .position.character + 1)]
    MalformedUsfm { position: Position, message: String },

    #[error("change reaches offset {end} but the document is only {len} characters long")]
    ChangeOutOfBounds { end: usize, len: usize },

    #[error("{change} change cannot be applied to a {format:?} document")]
    FormatMismatch {
        change: &'static str,
        format: DocumentFormat,
    },

    #[error("version {new} is not newer than current version {current}")]
    StaleVersion { current: i32, new: i32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn delta(op: usize, message: impl Into<String>) -> Self {
        Self::MalformedDelta {
            op,
            message: message.into(),
        }
    }

    pub(crate) fn usfm(position: Position, message: impl Into<String>) -> Self {
        Self::MalformedUsfm {
            position,
            message: message.into(),
        }
    }
}
