//! Splits USFM text into marker and text tokens with source ranges.

use std::sync::LazyLock;

use regex::Regex;
use tower_lsp::lsp_types::{Position, Range};

/// `\name`, `\+name`, `\name*`, the milestone closer `\*`, or `//`.
static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(\+?)([A-Za-z0-9][A-Za-z0-9\-]*)(\*?)|\\\*|//").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind<'a> {
    /// Opening marker. `line_end` is set when only blanks follow it on its line.
    Marker {
        name: &'a str,
        nested: bool,
        line_end: bool,
    },
    EndMarker {
        name: &'a str,
    },
    /// `\*`, closing a milestone.
    MilestoneEnd,
    OptBreak,
    Text(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    /// Source range. For opening markers this excludes the separator blank.
    pub range: Range,
    /// Byte offset of the token in the tokenized text.
    pub offset: usize,
}

/// Position reached after reading `text` from `position`. `\r\n` counts as
/// one line break.
pub fn advance(mut position: Position, text: &str) -> Position {
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                position.line += 1;
                position.character = 0;
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                position.line += 1;
                position.character = 0;
            }
            _ => position.character += 1,
        }
    }
    position
}

/// Tokenize `text`, which starts at `start` in its document.
pub fn tokenize(text: &str, start: Position) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut position = start;
    let mut cursor = 0;

    for captures in MARKER.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if whole.start() > cursor {
            let piece = &text[cursor..whole.start()];
            let end = advance(position, piece);
            tokens.push(Token {
                kind: TokenKind::Text(piece),
                range: Range::new(position, end),
                offset: cursor,
            });
            position = end;
        }

        let marker_end = advance(position, whole.as_str());
        let range = Range::new(position, marker_end);
        position = marker_end;
        cursor = whole.end();

        let kind = match (captures.get(2), captures.get(3)) {
            (Some(name), Some(star)) if !star.as_str().is_empty() => TokenKind::EndMarker {
                name: name.as_str(),
            },
            (Some(name), _) => {
                let rest = &text[cursor..];
                let blanks = rest.len() - rest.trim_start_matches([' ', '\t']).len();
                let after = &rest[blanks..];
                let line_end = after.is_empty() || after.starts_with(['\n', '\r']);
                let separator = if rest.starts_with("\r\n") {
                    2
                } else if rest.starts_with([' ', '\t', '\n', '\r']) {
                    1
                } else {
                    0
                };
                position = advance(position, &rest[..separator]);
                cursor += separator;
                TokenKind::Marker {
                    name: name.as_str(),
                    nested: captures.get(1).is_some_and(|plus| !plus.as_str().is_empty()),
                    line_end,
                }
            }
            _ if whole.as_str() == "//" => TokenKind::OptBreak,
            _ => TokenKind::MilestoneEnd,
        };
        tokens.push(Token {
            kind,
            range,
            offset: whole.start(),
        });
    }

    if cursor < text.len() {
        let piece = &text[cursor..];
        tokens.push(Token {
            kind: TokenKind::Text(piece),
            range: Range::new(position, advance(position, piece)),
            offset: cursor,
        });
    }
    tokens
}
