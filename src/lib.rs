//! Incremental text and tree synchronization for scripture documents.
//!
//! A [`Document`] keeps a flat text buffer and a [`ScriptureTree`] of books,
//! chapters, verses, paragraphs, tables and notes in step as edits arrive.
//! Edits re-parse only the top-level nodes they touch. Two source formats are
//! supported: rich-text op streams ([`delta`]) and USFM marker text
//! ([`usfm`]).

pub mod delta;
mod document;
mod error;
pub(crate) mod settings;
pub mod tree;
pub mod usfm;

pub use document::{Document, DocumentChange, DocumentFormat, DocumentStore, TextPositionIndex};
pub use error::{Error, Result};
pub use settings::{discover_settings, load_settings, DeltaSettings, Settings, UsfmSettings};
pub use tree::{
    Attributes, CellAlign, DetachedNode, NodeId, NodeRef, NodeType, ScriptureNode, ScriptureTree,
    EMBED_PLACEHOLDER,
};
