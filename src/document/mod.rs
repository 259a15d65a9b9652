//! Documents and their text.
//!
//! This module provides:
//! - `TextPositionIndex` for offset <-> position conversion
//! - `Document` and `DocumentStore` for document lifecycle management

mod state;
mod text;

pub use state::{Document, DocumentChange, DocumentFormat, DocumentStore};
pub use text::TextPositionIndex;
