//! Builds scripture nodes from a run of delta ops.

use std::mem;

use serde_json::Value;
use tower_lsp::lsp_types::{Position, Range};

use super::op::{AttributeMap, Delta, InsertValue, Op, OpCursor, OpKind};
use crate::error::{Error, Result};
use crate::settings::DeltaSettings;
use crate::tree::{Attributes, CellAlign, DetachedNode, ScriptureNode, EMBED_PLACEHOLDER};

/// Where a parse starts and how much it reads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParseWindow {
    pub position: Position,
    pub offset: usize,
    /// Index the first produced node will have among the root's children.
    pub node_index: usize,
    pub cursor: OpCursor,
    /// Characters to consume; `usize::MAX` reads to the end.
    pub length: usize,
}

impl ParseWindow {
    pub(crate) fn whole() -> Self {
        Self {
            position: Position::new(0, 0),
            offset: 0,
            node_index: 0,
            cursor: OpCursor::default(),
            length: usize::MAX,
        }
    }
}

/// Output of a parse. `line_ops` and `line_nodes` hold one entry for the
/// starting line and one for every line break read.
#[derive(Debug)]
pub(crate) struct ParsedDelta {
    pub nodes: Vec<DetachedNode>,
    pub line_ops: Vec<OpCursor>,
    pub line_nodes: Vec<usize>,
    pub text: String,
    pub end: Position,
}

pub(crate) fn parse(ops: &[Op], window: ParseWindow, settings: &DeltaSettings) -> Result<ParsedDelta> {
    let mut parser = DeltaParser::new(ops, window, settings);
    parser.run()?;
    Ok(parser.finish())
}

struct OpenStyle {
    value: Value,
    start: Position,
    saved: Vec<DetachedNode>,
}

struct OpenRow {
    id: String,
    start: Position,
    end: Position,
    cells: Vec<DetachedNode>,
}

struct OpenTable {
    id: String,
    start: Position,
    rows: Vec<DetachedNode>,
    row: Option<OpenRow>,
}

struct DeltaParser<'a> {
    ops: &'a [Op],
    window: ParseWindow,
    settings: &'a DeltaSettings,
    position: Position,
    offset: usize,
    /// Finished top-level nodes.
    out: Vec<DetachedNode>,
    /// Inline children of the innermost open character style (or the block).
    inline: Vec<DetachedNode>,
    styles: Vec<OpenStyle>,
    table: Option<OpenTable>,
    block_start: Position,
    line_ops: Vec<OpCursor>,
    line_nodes: Vec<usize>,
    text: String,
    op_index: usize,
}

impl<'a> DeltaParser<'a> {
    fn new(ops: &'a [Op], window: ParseWindow, settings: &'a DeltaSettings) -> Self {
        let mut parser = Self {
            ops,
            window,
            settings,
            position: window.position,
            offset: window.offset,
            out: Vec::new(),
            inline: Vec::new(),
            styles: Vec::new(),
            table: None,
            block_start: window.position,
            line_ops: Vec::new(),
            line_nodes: Vec::new(),
            text: String::new(),
            op_index: window.cursor.index,
        };
        let start = parser.canonical(window.cursor.index, window.cursor.skip);
        parser.line_ops.push(start);
        parser.line_nodes.push(window.node_index);
        parser
    }

    fn canonical(&self, index: usize, skip: usize) -> OpCursor {
        match self.ops.get(index) {
            Some(op) if skip >= op.len() => OpCursor {
                index: index + 1,
                skip: 0,
            },
            _ => OpCursor { index, skip },
        }
    }

    fn run(&mut self) -> Result<()> {
        let mut remaining = self.window.length;
        let ops = self.ops;
        let first = self.window.cursor.index;
        for (index, op) in ops.iter().enumerate().skip(first) {
            if remaining == 0 {
                break;
            }
            self.op_index = index;
            let skip = if index == first { self.window.cursor.skip } else { 0 };
            let available = op.len().saturating_sub(skip);
            let take = available.min(remaining);
            remaining -= take;
            match &op.kind {
                OpKind::Insert(InsertValue::Text(text)) => {
                    self.text_run(text, skip, take, op.attributes.as_ref())?;
                }
                OpKind::Insert(InsertValue::Embed(embed)) => {
                    if take > 0 {
                        self.embed(embed, op.attributes.as_ref())?;
                    }
                }
                OpKind::Retain(_) | OpKind::Delete(_) => {
                    return Err(Error::delta(index, "document ops must all be inserts"));
                }
            }
        }
        Ok(())
    }

    fn advance(&mut self, chars: usize) {
        self.position.character += chars as u32;
        self.offset += chars;
    }

    fn text_run(
        &mut self,
        text: &str,
        skip: usize,
        take: usize,
        attributes: Option<&AttributeMap>,
    ) -> Result<()> {
        let mut segment = String::new();
        for (local, c) in text.chars().enumerate().skip(skip).take(take) {
            match c {
                '\n' => {
                    self.text_segment(mem::take(&mut segment), attributes)?;
                    self.newline(local, attributes)?;
                }
                '\r' => {
                    return Err(Error::delta(self.op_index, "carriage return in op text"));
                }
                c => segment.push(c),
            }
        }
        self.text_segment(segment, attributes)
    }

    fn text_segment(&mut self, segment: String, attributes: Option<&AttributeMap>) -> Result<()> {
        if segment.is_empty() {
            return Ok(());
        }
        self.apply_char_styles(attributes)?;
        let len = segment.chars().count();
        let start = self.position;
        self.advance(len);
        let range = Range::new(start, self.position);
        self.text.push_str(&segment);

        let target = attributes
            .filter(|attrs| attrs.contains_key("char"))
            .and_then(|attrs| attrs.get("ref"));
        let node = match target {
            Some(target) => DetachedNode::new(
                ScriptureNode::Ref {
                    display: segment,
                    target: ref_target(target),
                },
                range,
            ),
            None => DetachedNode::text(segment, range),
        };
        self.inline.push(node);
        Ok(())
    }

    /// Sync the open character styles with an op's `char` attribute.
    fn apply_char_styles(&mut self, attributes: Option<&AttributeMap>) -> Result<()> {
        let wanted = match attributes.and_then(|attrs| attrs.get("char")) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values.clone(),
            Some(value @ Value::Object(_)) => vec![value.clone()],
            Some(other) => {
                return Err(Error::delta(
                    self.op_index,
                    format!("char attribute must be an object or array, got {other}"),
                ))
            }
        };
        let keep = self
            .styles
            .iter()
            .zip(&wanted)
            .take_while(|(open, value)| &open.value == *value)
            .count();
        while self.styles.len() > keep {
            self.pop_style();
        }
        for value in wanted.into_iter().skip(keep) {
            if value.get("style").and_then(Value::as_str).is_none() {
                return Err(Error::delta(self.op_index, "char attribute without a style"));
            }
            self.styles.push(OpenStyle {
                value,
                start: self.position,
                saved: mem::take(&mut self.inline),
            });
        }
        Ok(())
    }

    fn pop_style(&mut self) {
        let Some(open) = self.styles.pop() else {
            return;
        };
        let children = mem::replace(&mut self.inline, open.saved);
        let attrs = object_attrs(&open.value, &["style", "cid"]);
        let style = string_field(&open.value, "style").unwrap_or_default();
        self.inline.push(DetachedNode::with_children(
            ScriptureNode::CharacterStyle { style, attrs },
            Range::new(open.start, self.position),
            children,
        ));
    }

    fn close_styles(&mut self) {
        while !self.styles.is_empty() {
            self.pop_style();
        }
    }

    fn embed(&mut self, embed: &AttributeMap, attributes: Option<&AttributeMap>) -> Result<()> {
        self.apply_char_styles(attributes)?;
        let start = self.position;
        self.advance(1);
        self.text.push(EMBED_PLACEHOLDER);
        let range = Range::new(start, self.position);

        let Some((kind, value)) = embed.iter().next() else {
            return Err(Error::delta(self.op_index, "empty embed"));
        };
        let node = match kind.as_str() {
            "chapter" => DetachedNode::new(
                ScriptureNode::Chapter {
                    number: self.required(value, "number", "chapter")?,
                    alt_number: string_field(value, "altnumber"),
                    pub_number: string_field(value, "pubnumber"),
                },
                range,
            ),
            "verse" => DetachedNode::new(
                ScriptureNode::Verse {
                    number: self.required(value, "number", "verse")?,
                    alt_number: string_field(value, "altnumber"),
                    pub_number: string_field(value, "pubnumber"),
                },
                range,
            ),
            "note" => {
                let children = self.nested(value, start)?;
                DetachedNode::with_children(
                    ScriptureNode::Note {
                        style: string_field(value, "style").unwrap_or_else(|| "f".to_string()),
                        caller: string_field(value, "caller").unwrap_or_else(|| "+".to_string()),
                        category: string_field(value, "category"),
                    },
                    range,
                    children,
                )
            }
            "figure" => {
                let children = self.nested(value, start)?;
                DetachedNode::with_children(
                    ScriptureNode::CharacterStyle {
                        style: string_field(value, "style").unwrap_or_else(|| "fig".to_string()),
                        attrs: object_attrs(value, &["style", "contents"]),
                    },
                    range,
                    children,
                )
            }
            "ms" => {
                let style = self.required(value, "style", "milestone")?;
                DetachedNode::new(
                    ScriptureNode::Milestone {
                        is_start: !style.ends_with("-e"),
                        style,
                        sid: string_field(value, "sid"),
                        eid: string_field(value, "eid"),
                        attrs: object_attrs(value, &["style", "sid", "eid"]),
                    },
                    range,
                )
            }
            "optbreak" => DetachedNode::new(ScriptureNode::OptBreak, range),
            _ => DetachedNode::text(EMBED_PLACEHOLDER, range),
        };
        self.inline.push(node);
        Ok(())
    }

    fn required(&self, value: &Value, field: &str, embed: &str) -> Result<String> {
        string_field(value, field)
            .ok_or_else(|| Error::delta(self.op_index, format!("{embed} embed without {field}")))
    }

    /// Parse an embed's `contents` ops. They occupy no buffer characters, so
    /// every produced node gets the empty range at `at`.
    fn nested(&self, value: &Value, at: Position) -> Result<Vec<DetachedNode>> {
        let Some(contents) = value.get("contents") else {
            return Ok(Vec::new());
        };
        let delta: Delta = match contents {
            Value::Array(_) => Delta {
                ops: serde_json::from_value(contents.clone())?,
            },
            _ => serde_json::from_value(contents.clone())?,
        };
        let parsed = parse(&delta.ops, ParseWindow::whole(), self.settings).map_err(|err| match err {
            Error::MalformedDelta { message, .. } => {
                Error::delta(self.op_index, format!("in embedded contents: {message}"))
            }
            other => other,
        })?;
        let mut nodes = parsed.nodes;
        for node in &mut nodes {
            collapse(node, at);
        }
        Ok(nodes)
    }

    /// Handle a `\n` at `local` within the current op.
    fn newline(&mut self, local: usize, attributes: Option<&AttributeMap>) -> Result<()> {
        self.close_styles();
        let newline_line = self.position.line;
        self.advance(1);
        self.text.push('\n');
        let end = Position::new(self.position.line + 1, 0);

        let empty = AttributeMap::new();
        let attrs = attributes.unwrap_or(&empty);
        if attrs.contains_key("table") {
            self.close_cell(attrs, end)?;
        } else {
            self.close_table_for_block(newline_line);
            let (style, para_attrs) = match attrs.get("para") {
                Some(para) => (
                    string_field(para, "style")
                        .unwrap_or_else(|| self.settings.default_paragraph_style.clone()),
                    object_attrs(para, &["style"]),
                ),
                None => (
                    self.settings.default_paragraph_style.clone(),
                    map_attrs(attrs, &["char", "ref", "segment"]),
                ),
            };
            let children = mem::take(&mut self.inline);
            self.out.push(DetachedNode::with_children(
                ScriptureNode::Paragraph {
                    style,
                    attrs: para_attrs,
                },
                Range::new(self.block_start, end),
                children,
            ));
        }

        self.position = end;
        self.block_start = end;
        let cursor = self.canonical(self.op_index, local + 1);
        self.line_ops.push(cursor);
        self.line_nodes.push(self.next_node_index());
        Ok(())
    }

    fn next_node_index(&self) -> usize {
        self.window.node_index + self.out.len()
    }

    fn close_cell(&mut self, attrs: &AttributeMap, end: Position) -> Result<()> {
        let table_id = id_field(attrs.get("table"));
        let row_id = id_field(attrs.get("row"));

        if self.table.as_ref().is_some_and(|table| table.id != table_id) {
            self.close_table_for_block(self.position.line);
        }
        let block_start = self.block_start;
        let table = self.table.get_or_insert_with(|| OpenTable {
            id: table_id,
            start: block_start,
            rows: Vec::new(),
            row: None,
        });
        if table.row.as_ref().is_some_and(|row| row.id != row_id) {
            close_row(table);
        }
        let row = table.row.get_or_insert_with(|| OpenRow {
            id: row_id,
            start: block_start,
            end: block_start,
            cells: Vec::new(),
        });

        let cell = attrs.get("cell");
        let col_span = cell
            .and_then(|cell| cell.get("colspan"))
            .and_then(|span| match span {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .unwrap_or(1) as u32;
        let node = ScriptureNode::Cell {
            style: cell
                .and_then(|cell| string_field(cell, "style"))
                .unwrap_or_else(|| "tc1".to_string()),
            align: cell
                .and_then(|cell| string_field(cell, "align"))
                .map(|align| CellAlign::parse(&align))
                .unwrap_or_default(),
            col_span,
        };
        let children = mem::take(&mut self.inline);
        row.cells.push(DetachedNode::with_children(
            node,
            Range::new(block_start, end),
            children,
        ));
        row.end = end;
        Ok(())
    }

    /// Close an open table before a block that does not belong to it. The
    /// lines of that block were recorded against the table's index, so move
    /// them to the slot the block will take.
    fn close_table_for_block(&mut self, last_line: u32) {
        let Some(mut table) = self.table.take() else {
            return;
        };
        close_row(&mut table);
        let end = table
            .rows
            .last()
            .map(|row| row.range.end)
            .unwrap_or(table.start);
        self.out.push(DetachedNode::with_children(
            ScriptureNode::Table,
            Range::new(table.start, end),
            table.rows,
        ));

        let index = self.next_node_index();
        let first = (self.block_start.line - self.window.position.line) as usize;
        let last = (last_line - self.window.position.line) as usize;
        for entry in &mut self.line_nodes[first..=last] {
            *entry = index;
        }
    }

    fn finish(mut self) -> ParsedDelta {
        self.close_styles();
        self.close_table_for_block(self.position.line);
        self.out.append(&mut self.inline);
        ParsedDelta {
            nodes: self.out,
            line_ops: self.line_ops,
            line_nodes: self.line_nodes,
            text: self.text,
            end: self.position,
        }
    }
}

fn close_row(table: &mut OpenTable) {
    if let Some(row) = table.row.take() {
        table.rows.push(DetachedNode::with_children(
            ScriptureNode::Row,
            Range::new(row.start, row.end),
            row.cells,
        ));
    }
}

fn collapse(node: &mut DetachedNode, at: Position) {
    node.range = Range::new(at, at);
    for child in &mut node.children {
        collapse(child, at);
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(scalar_string)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Table and row ids may be given as `{"id": "..."}` or a bare string.
fn id_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::Object(_)) => value.and_then(|v| string_field(v, "id")).unwrap_or_default(),
        Some(other) => scalar_string(other).unwrap_or_default(),
        None => String::new(),
    }
}

fn ref_target(value: &Value) -> String {
    match value {
        Value::Object(_) => string_field(value, "loc")
            .or_else(|| string_field(value, "target"))
            .unwrap_or_default(),
        other => scalar_string(other).unwrap_or_default(),
    }
}

fn object_attrs(value: &Value, skip: &[&str]) -> Attributes {
    match value {
        Value::Object(map) => map_attrs(map, skip),
        _ => Attributes::new(),
    }
}

fn map_attrs(map: &AttributeMap, skip: &[&str]) -> Attributes {
    map.iter()
        .filter(|(key, _)| !skip.contains(&key.as_str()))
        .filter_map(|(key, value)| scalar_string(value).map(|value| (key.clone(), value)))
        .collect()
}
