//! USFM marker-text documents.

pub mod lexer;
mod markers;
pub mod parser;
mod reconcile;

pub use lexer::{tokenize, Token, TokenKind};
pub use markers::{classify, MarkerKind};
pub use parser::{parse, ParsedUsfm};
pub use reconcile::UsfmReconciler;
