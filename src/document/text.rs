//! Text buffer and line table for position conversion.
//!
//! Offsets count Unicode scalar values. Line breaks are `\n`, `\r` and `\r\n`.

use std::sync::OnceLock;

use tower_lsp::lsp_types::{Position, Range, TextDocumentContentChangeEvent};

/// Start of every line, as a character offset and as a byte offset into the
/// buffer. Both vectors always have the same length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LineTable {
    offsets: Vec<usize>,
    bytes: Vec<usize>,
}

impl LineTable {
    fn push(&mut self, offset: usize, byte: usize) {
        self.offsets.push(offset);
        self.bytes.push(byte);
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }
}

/// A document's text together with a lazily computed line-offset table.
///
/// Full replacements drop the table; it is rebuilt by one forward scan on the
/// next query. Ranged edits patch it in place.
#[derive(Debug, Clone)]
pub struct TextPositionIndex {
    content: String,
    /// Length of `content` in characters.
    len: usize,
    lines: OnceLock<LineTable>,
}

impl TextPositionIndex {
    pub fn new(content: String) -> Self {
        let len = content.chars().count();
        Self {
            content,
            len,
            lines: OnceLock::new(),
        }
    }

    /// The full text buffer.
    pub fn text(&self) -> &str {
        &self.content
    }

    /// Length of the buffer in characters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn line_count(&self) -> usize {
        self.table().len()
    }

    /// Character offset of the start of every line.
    pub fn line_offsets(&self) -> &[usize] {
        &self.table().offsets
    }

    fn table(&self) -> &LineTable {
        self.lines.get_or_init(|| {
            let mut table = LineTable::default();
            table.push(0, 0);
            scan_line_starts(&self.content, 0, 0, &mut table);
            table
        })
    }

    /// Number of characters in the line break that ends `line`.
    fn terminator_len(&self, line: usize) -> usize {
        let table = self.table();
        let Some(&next) = table.bytes.get(line + 1) else {
            return 0;
        };
        let bytes = self.content.as_bytes();
        if bytes[next - 1] == b'\n' && next >= table.bytes[line] + 2 && bytes[next - 2] == b'\r' {
            2
        } else {
            1
        }
    }

    /// Offset one past the last non-line-break character of `line`.
    fn content_end(&self, line: usize) -> usize {
        let table = self.table();
        let next = table.offsets.get(line + 1).copied().unwrap_or(self.len);
        next - self.terminator_len(line)
    }

    /// Convert a position to an absolute offset, clamping out-of-range values.
    ///
    /// The result never lands inside a line break, so a position past the end
    /// of a line maps to the end of that line's content.
    pub fn offset_at(&self, position: Position) -> usize {
        let table = self.table();
        let line = (position.line as usize).min(table.len() - 1);
        let line_start = table.offsets[line];
        if position.character == 0 {
            return line_start;
        }
        let offset = line_start.saturating_add(position.character as usize);
        offset.min(self.content_end(line))
    }

    /// Convert an absolute offset to a position.
    ///
    /// When `range` is given the offset is clamped into it first. A range on a
    /// single line is resolved without searching the line table.
    pub fn position_at(&self, offset: usize, range: Option<Range>) -> Position {
        let table = self.table();
        let last_line = table.len() - 1;

        let (lower, upper, search_end) = match range {
            Some(range) if range.start.line == range.end.line => {
                let line = (range.start.line as usize).min(last_line);
                let start = self.offset_at(range.start);
                let end = self.offset_at(range.end).max(start);
                let offset = offset.max(start).min(end);
                return Position::new(line as u32, (offset - table.offsets[line]) as u32);
            }
            Some(range) => {
                let start = self.offset_at(range.start);
                let end = self.offset_at(range.end).max(start);
                (start, end, (range.end.line as usize).min(last_line))
            }
            None => (0, self.len, last_line),
        };

        let offset = offset.max(lower).min(upper);
        let line = table.offsets[..=search_end]
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        let offset = offset.min(self.content_end(line));
        Position::new(line as u32, (offset - table.offsets[line]) as u32)
    }

    /// Byte index into the buffer for a character offset.
    fn byte_at(&self, offset: usize) -> usize {
        let table = self.table();
        let offset = offset.min(self.len);
        let line = table.offsets.partition_point(|&start| start <= offset) - 1;
        let line_byte = table.bytes[line];
        let skip = offset - table.offsets[line];
        self.content[line_byte..]
            .char_indices()
            .nth(skip)
            .map(|(i, _)| line_byte + i)
            .unwrap_or(self.content.len())
    }

    /// Text between two offsets.
    pub fn slice(&self, start: usize, end: usize) -> &str {
        let start = self.byte_at(start);
        let end = self.byte_at(end).max(start);
        &self.content[start..end]
    }

    /// Text covered by `range`, or the whole buffer.
    pub fn get_text(&self, range: Option<Range>) -> &str {
        match range {
            Some(range) => self.slice(self.offset_at(range.start), self.offset_at(range.end)),
            None => &self.content,
        }
    }

    /// Apply a content change.
    ///
    /// A change without a range replaces the whole buffer and drops the line
    /// table. A ranged change splices fresh line starts for the inserted text
    /// over the lines it replaced and shifts every following entry.
    pub fn update(&mut self, change: &TextDocumentContentChangeEvent) {
        let Some(range) = change.range else {
            *self = Self::new(change.text.clone());
            return;
        };
        let (from, to) = if range.end < range.start {
            (range.end, range.start)
        } else {
            (range.start, range.end)
        };
        let start = self.offset_at(from);
        let end = self.offset_at(to).max(start);
        self.replace(start, end, &change.text);
    }

    /// Replace the characters in `start..end` with `text`.
    pub(crate) fn replace(&mut self, start: usize, end: usize, text: &str) {
        let start_line = self.position_at(start, None).line as usize;
        let end_line = self.position_at(end, None).line as usize;
        let start_byte = self.byte_at(start);
        let end_byte = self.byte_at(end);

        let mut table = self.lines.take().unwrap_or_else(|| {
            let mut table = LineTable::default();
            table.push(0, 0);
            scan_line_starts(&self.content, 0, 0, &mut table);
            table
        });

        self.content.replace_range(start_byte..end_byte, text);
        let inserted = text.chars().count();
        self.len = self.len + inserted - (end - start);

        if joins_line_break(&self.content, start_byte, start_byte + text.len()) {
            // A `\r` and `\n` on either side of the edit now form one break.
            return;
        }

        let mut fresh = LineTable::default();
        scan_line_starts(text, start, start_byte, &mut fresh);
        let fresh_count = fresh.len();
        table
            .offsets
            .splice(start_line + 1..=end_line, fresh.offsets);
        table.bytes.splice(start_line + 1..=end_line, fresh.bytes);

        let char_delta = inserted as isize - (end - start) as isize;
        let byte_delta = text.len() as isize - (end_byte - start_byte) as isize;
        let first_shifted = start_line + 1 + fresh_count;
        for offset in &mut table.offsets[first_shifted..] {
            *offset = offset.wrapping_add_signed(char_delta);
        }
        for byte in &mut table.bytes[first_shifted..] {
            *byte = byte.wrapping_add_signed(byte_delta);
        }

        self.lines = OnceLock::from(table);
    }
}

/// Push the start of every line that begins inside `text`.
///
/// `offset` and `byte` give the position of `text` within the buffer.
fn scan_line_starts(text: &str, offset: usize, byte: usize, table: &mut LineTable) {
    let mut chars = text.char_indices().peekable();
    let mut count = 0;
    while let Some((i, c)) = chars.next() {
        count += 1;
        match c {
            '\r' => {
                if let Some(&(_, '\n')) = chars.peek() {
                    chars.next();
                    count += 1;
                    table.push(offset + count, byte + i + 2);
                } else {
                    table.push(offset + count, byte + i + 1);
                }
            }
            '\n' => table.push(offset + count, byte + i + 1),
            _ => {}
        }
    }
}

/// Whether the edited span `start..end` (bytes, in the new buffer) created a
/// `\r\n` pair across one of its boundaries.
fn joins_line_break(content: &str, start: usize, end: usize) -> bool {
    let bytes = content.as_bytes();
    let crlf_at = |i: usize| i > 0 && i < bytes.len() && bytes[i - 1] == b'\r' && bytes[i] == b'\n';
    crlf_at(start) || crlf_at(end)
}
