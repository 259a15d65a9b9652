//! Builds scripture nodes from USFM tokens.
//!
//! Containers open on their marker and close on an explicit end marker or
//! implicitly when a marker that cannot nest inside them arrives. An implicit
//! close ends the container at the last token it consumed.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use tower_lsp::lsp_types::{Position, Range};

use super::lexer::{self, Token, TokenKind};
use super::markers::{self, MarkerKind};
use crate::error::{Error, Result};
use crate::settings::UsfmSettings;
use crate::tree::{Attributes, DetachedNode, NodeType, ScriptureNode};

static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z][\w\-]*)\s*=\s*"([^"]*)""#).unwrap());

/// Result of parsing a run of USFM.
#[derive(Debug)]
pub struct ParsedUsfm {
    pub nodes: Vec<DetachedNode>,
    pub end: Position,
    /// The first non-blank token, or the token after blank input, is not a
    /// paragraph, book or chapter marker, so in a whole document the node
    /// before it may run into it.
    pub continues_previous: bool,
    /// A table was still open when the input ended.
    pub ends_in_table: bool,
    /// A sidebar was still open when the input ended.
    pub open_sidebar: bool,
}

/// Parse `text`, which starts at `start` in its document.
pub fn parse(text: &str, start: Position, settings: &UsfmSettings) -> Result<ParsedUsfm> {
    parse_window(text, "", start, settings)
}

/// Parse `text` as a slice of a larger document in which it is followed by
/// `lookahead`.
///
/// `lookahead` is tokenized too, so markers at the end of `text` and the text
/// run before them are read as in the whole document, but no node is built
/// from it. It needs to reach the end of the line holding the first marker
/// after `text`.
pub fn parse_window(
    text: &str,
    lookahead: &str,
    start: Position,
    settings: &UsfmSettings,
) -> Result<ParsedUsfm> {
    let source = with_lookahead(text, lookahead);
    let tokens = lexer::tokenize(&source, start);
    let inside = tokens.partition_point(|token| token.offset < text.len());
    let mut parser = UsfmParser::new(settings, start);
    for (i, token) in tokens[..inside].iter().enumerate() {
        let trim = tokens
            .get(i + 1)
            .is_some_and(|next| ends_text_run(next, settings));
        parser.token(&clip(token, &text[token.offset..]), trim)?;
    }
    let continues_previous = runs_into_previous(&tokens, text, settings);
    parser.finish(lexer::advance(start, text), continues_previous)
}

/// Whether `text`, followed by `lookahead`, would run into the node before it
/// in a whole document. Malformed input is answered too.
pub fn continues_previous(text: &str, lookahead: &str, settings: &UsfmSettings) -> bool {
    let source = with_lookahead(text, lookahead);
    let tokens = lexer::tokenize(&source, Position::default());
    runs_into_previous(&tokens, text, settings)
}

fn with_lookahead<'t>(text: &'t str, lookahead: &str) -> Cow<'t, str> {
    if lookahead.is_empty() {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{text}{lookahead}"))
    }
}

/// Decided by the first non-blank token of `text`, or by the token after it
/// when `text` is blank.
fn runs_into_previous(tokens: &[Token<'_>], text: &str, settings: &UsfmSettings) -> bool {
    let inside = tokens.partition_point(|token| token.offset < text.len());
    let first = tokens[..inside].iter().find(|token| {
        !matches!(clip(token, &text[token.offset..]).kind, TokenKind::Text(piece) if piece.trim().is_empty())
    });
    first
        .or(tokens.get(inside))
        .map_or(true, |token| !ends_text_run(token, settings))
}

/// Paragraph, book and chapter markers end the text run before them.
fn ends_text_run(token: &Token<'_>, settings: &UsfmSettings) -> bool {
    match token.kind {
        TokenKind::Marker { name, line_end, .. } => {
            markers::classify(name, settings, line_end).trims_preceding_text()
        }
        _ => false,
    }
}

/// Cut a text token that runs past the end of the window back to `rest`.
fn clip<'t>(token: &Token<'t>, rest: &'t str) -> Token<'t> {
    match token.kind {
        TokenKind::Text(piece) if piece.len() > rest.len() => Token {
            kind: TokenKind::Text(rest),
            range: Range::new(token.range.start, lexer::advance(token.range.start, rest)),
            offset: token.offset,
        },
        _ => *token,
    }
}

struct Open {
    node: ScriptureNode,
    kind: MarkerKind,
    start: Position,
    children: Vec<DetachedNode>,
}

/// Something that needs the next text token to complete.
enum Expect {
    BookCode,
    Chapter(Position),
    Verse(Position),
    Alternate(MarkerKind),
    Caller,
}

/// Leaves whose content runs up to a closing marker.
enum Pending {
    Milestone {
        style: String,
        start: Position,
        end: Position,
        attrs: Attributes,
    },
    Ref {
        start: Position,
        content: String,
    },
    Category {
        content: String,
    },
}

struct UsfmParser<'a> {
    settings: &'a UsfmSettings,
    stack: Vec<Open>,
    out: Vec<DetachedNode>,
    last_end: Position,
    expect: Option<Expect>,
    pending: Option<Pending>,
}

impl<'a> UsfmParser<'a> {
    fn new(settings: &'a UsfmSettings, start: Position) -> Self {
        Self {
            settings,
            stack: Vec::new(),
            out: Vec::new(),
            last_end: start,
            expect: None,
            pending: None,
        }
    }

    fn classify(&self, name: &str, line_end: bool) -> MarkerKind {
        markers::classify(name, self.settings, line_end)
    }

    fn token(&mut self, token: &Token<'_>, trim: bool) -> Result<()> {
        if let TokenKind::Text(text) = token.kind {
            return self.text(text, token.range.start, trim);
        }
        if let Some(expect) = self.expect.take() {
            self.missing(expect, token.range.start)?;
        }

        match token.kind {
            TokenKind::Marker { name, nested, line_end } => {
                self.flush_pending();
                let kind = self.classify(name, line_end);
                self.marker(name, kind, nested, token.range)?;
            }
            TokenKind::EndMarker { name } => self.end_marker(name, token.range)?,
            TokenKind::MilestoneEnd => match self.pending.take() {
                Some(Pending::Milestone {
                    style, start, attrs, ..
                }) => {
                    self.push_milestone(style, Range::new(start, token.range.end), attrs);
                }
                other => {
                    self.pending = other;
                    return Err(Error::usfm(token.range.start, "\\* without an open milestone"));
                }
            },
            TokenKind::OptBreak => {
                self.flush_pending();
                self.push(DetachedNode::new(ScriptureNode::OptBreak, token.range));
            }
            TokenKind::Text(_) => {}
        }
        self.last_end = token.range.end;
        Ok(())
    }

    /// A marker arrived where a number, code or caller was required.
    fn missing(&mut self, expect: Expect, at: Position) -> Result<()> {
        match expect {
            Expect::BookCode => Err(Error::usfm(at, "\\id without a book code")),
            Expect::Chapter(marker) => Err(Error::usfm(marker, "\\c without a chapter number")),
            Expect::Verse(marker) => Err(Error::usfm(marker, "\\v without a verse number")),
            Expect::Alternate(_) => Err(Error::usfm(at, "alternate number marker without a number")),
            Expect::Caller => {
                self.set_caller("+".to_string());
                Ok(())
            }
        }
    }

    fn marker(&mut self, name: &str, kind: MarkerKind, nested: bool, range: Range) -> Result<()> {
        match kind {
            MarkerKind::Book => {
                self.close_all();
                self.open(ScriptureNode::Book { code: String::new() }, kind, range.start);
                self.expect = Some(Expect::BookCode);
            }
            MarkerKind::Chapter => {
                self.close_all();
                self.expect = Some(Expect::Chapter(range.start));
            }
            MarkerKind::ChapterPub => {
                self.close_blocks();
                self.expect = Some(Expect::Alternate(kind));
            }
            MarkerKind::ChapterAlt | MarkerKind::VerseAlt | MarkerKind::VersePub => {
                self.expect = Some(Expect::Alternate(kind));
            }
            MarkerKind::Verse => {
                self.close_inline();
                self.expect = Some(Expect::Verse(range.start));
            }
            MarkerKind::Paragraph => {
                self.close_blocks();
                self.open(
                    ScriptureNode::Paragraph {
                        style: name.to_string(),
                        attrs: Attributes::new(),
                    },
                    kind,
                    range.start,
                );
            }
            MarkerKind::Row => {
                self.close_until(|open| matches!(open.kind, MarkerKind::SidebarStart) || is_table(open));
                if !self.stack.last().is_some_and(is_table) {
                    self.open(ScriptureNode::Table, kind, range.start);
                }
                self.open(ScriptureNode::Row, kind, range.start);
            }
            MarkerKind::Cell => {
                if self.stack.iter().any(|open| open.node.node_type() == NodeType::Row) {
                    self.close_until(|open| open.node.node_type() == NodeType::Row);
                } else {
                    self.close_blocks();
                    self.open(ScriptureNode::Table, MarkerKind::Row, range.start);
                    self.open(ScriptureNode::Row, MarkerKind::Row, range.start);
                }
                let (style, align, col_span) = markers::cell(name);
                self.open(
                    ScriptureNode::Cell {
                        style,
                        align,
                        col_span,
                    },
                    kind,
                    range.start,
                );
            }
            MarkerKind::Character | MarkerKind::NoteCharacter => {
                if !nested {
                    let closes_note_characters = kind == MarkerKind::NoteCharacter;
                    self.close_until(|open| match open.kind {
                        MarkerKind::Character => false,
                        MarkerKind::NoteCharacter => !closes_note_characters,
                        _ => true,
                    });
                }
                self.open(
                    ScriptureNode::CharacterStyle {
                        style: name.to_string(),
                        attrs: Attributes::new(),
                    },
                    kind,
                    range.start,
                );
            }
            MarkerKind::Note => {
                self.open(
                    ScriptureNode::Note {
                        style: name.to_string(),
                        caller: String::new(),
                        category: None,
                    },
                    kind,
                    range.start,
                );
                self.expect = Some(Expect::Caller);
            }
            MarkerKind::Milestone => {
                self.pending = Some(Pending::Milestone {
                    style: name.to_string(),
                    start: range.start,
                    end: range.end,
                    attrs: Attributes::new(),
                });
            }
            MarkerKind::SidebarStart => {
                self.close_all();
                self.open(
                    ScriptureNode::Sidebar {
                        style: name.to_string(),
                        category: None,
                    },
                    kind,
                    range.start,
                );
            }
            MarkerKind::SidebarEnd => {
                if !self.stack.iter().any(|open| open.kind == MarkerKind::SidebarStart) {
                    return Err(Error::usfm(range.start, "\\esbe without an open sidebar"));
                }
                self.close_until(|open| open.kind == MarkerKind::SidebarStart);
                self.close(range.end);
            }
            MarkerKind::Category => {
                self.pending = Some(Pending::Category {
                    content: String::new(),
                });
            }
            MarkerKind::Ref => {
                self.pending = Some(Pending::Ref {
                    start: range.start,
                    content: String::new(),
                });
            }
        }
        Ok(())
    }

    fn end_marker(&mut self, name: &str, range: Range) -> Result<()> {
        match (name, self.pending.take()) {
            ("ref", Some(Pending::Ref { start, content })) => {
                let (display, target) = match content.split_once('|') {
                    Some((display, target)) => (display.trim().to_string(), target.trim().to_string()),
                    None => (content.trim().to_string(), content.trim().to_string()),
                };
                self.push(DetachedNode::new(
                    ScriptureNode::Ref { display, target },
                    Range::new(start, range.end),
                ));
                return Ok(());
            }
            ("cat", Some(Pending::Category { content })) => {
                let category = content.trim().to_string();
                for open in self.stack.iter_mut().rev() {
                    match &mut open.node {
                        ScriptureNode::Note { category: slot, .. }
                        | ScriptureNode::Sidebar { category: slot, .. } => {
                            *slot = Some(category);
                            break;
                        }
                        _ => {}
                    }
                }
                return Ok(());
            }
            (_, pending) => {
                self.pending = pending;
                self.flush_pending();
            }
        }

        if matches!(name, "ca" | "va" | "vp") {
            if let Some(node) = self.children_mut().last_mut() {
                node.range.end = range.end;
            }
            return Ok(());
        }

        let Some(depth) = self.stack.iter().rposition(|open| match &open.node {
            ScriptureNode::CharacterStyle { style, .. } | ScriptureNode::Note { style, .. } => {
                style == name
            }
            _ => false,
        }) else {
            return Err(Error::usfm(range.start, format!("\\{name}* without an open \\{name}")));
        };
        while self.stack.len() > depth + 1 {
            self.close(self.last_end);
        }
        self.close(range.end);
        Ok(())
    }

    fn text(&mut self, text: &str, start: Position, trim: bool) -> Result<()> {
        let text = if trim { text.trim_end() } else { text };
        if text.is_empty() {
            return Ok(());
        }

        if let Some(pending) = &mut self.pending {
            match pending {
                Pending::Milestone { end, attrs, .. } => {
                    let content = text.trim().trim_start_matches('|');
                    attrs.extend(parse_attributes(content, "default"));
                    *end = lexer::advance(start, text);
                }
                Pending::Ref { content, .. } | Pending::Category { content } => content.push_str(text),
            }
            self.last_end = lexer::advance(start, text);
            return Ok(());
        }

        let (start, text) = match self.expect.take() {
            Some(expect) => match self.expected_word(expect, start, text)? {
                Some(rest) => rest,
                None => return Ok(()),
            },
            None => (start, text),
        };

        let (content, attributes) = match text.split_once('|') {
            Some((content, attributes)) if self.in_character_style() => (content, Some(attributes)),
            _ => (text, None),
        };
        if let Some(attributes) = attributes {
            if let Some(Open {
                node: ScriptureNode::CharacterStyle { style, attrs },
                ..
            }) = self.stack.last_mut()
            {
                let parsed = parse_attributes(attributes, markers::default_attribute(style));
                attrs.extend(parsed);
            }
        }

        let end = lexer::advance(start, content);
        let top_level_blank = self.stack.is_empty() && content.trim().is_empty();
        if !content.is_empty() && !top_level_blank {
            self.push(DetachedNode::text(content, Range::new(start, end)));
        }
        self.last_end = lexer::advance(start, text);
        Ok(())
    }

    /// Consume the word a marker asked for. Returns the text that follows it,
    /// if any.
    fn expected_word<'t>(
        &mut self,
        expect: Expect,
        start: Position,
        text: &'t str,
    ) -> Result<Option<(Position, &'t str)>> {
        let trimmed = text.trim_start();
        let lead = &text[..text.len() - trimmed.len()];
        let word_len = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        let word = &trimmed[..word_len];
        let word_start = lexer::advance(start, lead);
        let word_end = lexer::advance(word_start, word);
        if word.is_empty() {
            self.expect = Some(expect);
            return Ok(None);
        }

        match expect {
            Expect::BookCode => {
                if let Some(Open {
                    node: ScriptureNode::Book { code },
                    ..
                }) = self.stack.last_mut()
                {
                    *code = word.to_string();
                }
            }
            Expect::Chapter(marker) => self.push(DetachedNode::new(
                ScriptureNode::Chapter {
                    number: word.to_string(),
                    alt_number: None,
                    pub_number: None,
                },
                Range::new(marker, word_end),
            )),
            Expect::Verse(marker) => self.push(DetachedNode::new(
                ScriptureNode::Verse {
                    number: word.to_string(),
                    alt_number: None,
                    pub_number: None,
                },
                Range::new(marker, word_end),
            )),
            Expect::Alternate(kind) => self.set_alternate(kind, word, word_end),
            Expect::Caller => self.set_caller(word.to_string()),
        }
        self.last_end = word_end;

        // One blank separates the word from what follows.
        let rest = &trimmed[word_len..];
        let rest = rest
            .strip_prefix("\r\n")
            .or_else(|| rest.strip_prefix([' ', '\t', '\n', '\r']))
            .unwrap_or(rest);
        if rest.is_empty() {
            return Ok(None);
        }
        let skipped = &trimmed[word_len..trimmed.len() - rest.len()];
        Ok(Some((lexer::advance(word_end, skipped), rest)))
    }

    /// Attach an alternate or published number to the chapter or verse just
    /// before it. Numbers with nothing to attach to are dropped.
    fn set_alternate(&mut self, kind: MarkerKind, word: &str, end: Position) {
        let want = match kind {
            MarkerKind::ChapterAlt | MarkerKind::ChapterPub => NodeType::Chapter,
            _ => NodeType::Verse,
        };
        let target = self
            .children_mut()
            .last_mut()
            .filter(|node| node.node.node_type() == want);
        let Some(target) = target else {
            return;
        };
        match (&mut target.node, kind) {
            (ScriptureNode::Chapter { alt_number, .. }, MarkerKind::ChapterAlt)
            | (ScriptureNode::Verse { alt_number, .. }, MarkerKind::VerseAlt) => {
                *alt_number = Some(word.to_string());
            }
            (ScriptureNode::Chapter { pub_number, .. }, MarkerKind::ChapterPub)
            | (ScriptureNode::Verse { pub_number, .. }, MarkerKind::VersePub) => {
                *pub_number = Some(word.to_string());
            }
            _ => {}
        }
        if kind == MarkerKind::ChapterPub {
            target.range.end = end;
        }
    }

    fn set_caller(&mut self, caller: String) {
        if let Some(Open {
            node: ScriptureNode::Note { caller: slot, .. },
            ..
        }) = self.stack.last_mut()
        {
            *slot = caller;
        }
    }

    fn in_character_style(&self) -> bool {
        self.stack
            .last()
            .is_some_and(|open| matches!(open.node, ScriptureNode::CharacterStyle { .. }))
    }

    fn children_mut(&mut self) -> &mut Vec<DetachedNode> {
        match self.stack.last_mut() {
            Some(open) => &mut open.children,
            None => &mut self.out,
        }
    }

    fn push(&mut self, node: DetachedNode) {
        self.children_mut().push(node);
    }

    fn push_milestone(&mut self, style: String, range: Range, mut attrs: Attributes) {
        let sid = attrs.remove("sid");
        let eid = attrs.remove("eid");
        self.push(DetachedNode::new(
            ScriptureNode::Milestone {
                is_start: !style.ends_with("-e"),
                style,
                sid,
                eid,
                attrs,
            },
            range,
        ));
    }

    /// Complete a milestone, ref or category cut short by another token.
    fn flush_pending(&mut self) {
        match self.pending.take() {
            Some(Pending::Milestone {
                style,
                start,
                end,
                attrs,
            }) => self.push_milestone(style, Range::new(start, end), attrs),
            Some(Pending::Ref { start, content }) => {
                let display = content.trim().to_string();
                self.push(DetachedNode::new(
                    ScriptureNode::Ref {
                        target: display.clone(),
                        display,
                    },
                    Range::new(start, self.last_end),
                ));
            }
            Some(Pending::Category { .. }) | None => {}
        }
    }

    fn open(&mut self, node: ScriptureNode, kind: MarkerKind, start: Position) {
        self.stack.push(Open {
            node,
            kind,
            start,
            children: Vec::new(),
        });
    }

    /// Close the innermost container at `end`.
    fn close(&mut self, end: Position) {
        let Some(open) = self.stack.pop() else {
            return;
        };
        let node = DetachedNode::with_children(open.node, Range::new(open.start, end), open.children);
        self.push(node);
    }

    /// Close containers until `keep` holds for the innermost one.
    fn close_until(&mut self, keep: impl Fn(&Open) -> bool) {
        while self.stack.last().is_some_and(|open| !keep(open)) {
            self.close(self.last_end);
        }
    }

    fn close_all(&mut self) {
        self.close_until(|_| false);
    }

    /// Close everything inside the current sidebar, or everything.
    fn close_blocks(&mut self) {
        self.close_until(|open| open.kind == MarkerKind::SidebarStart);
    }

    /// Close character styles, keeping notes and blocks open.
    fn close_inline(&mut self) {
        self.close_until(|open| {
            !matches!(open.kind, MarkerKind::Character | MarkerKind::NoteCharacter)
        });
    }

    fn finish(mut self, end: Position, continues_previous: bool) -> Result<ParsedUsfm> {
        if let Some(expect) = self.expect.take() {
            self.missing(expect, end)?;
        }
        self.flush_pending();
        let ends_in_table = self.stack.iter().any(is_table);
        let open_sidebar = self
            .stack
            .iter()
            .any(|open| open.kind == MarkerKind::SidebarStart);
        self.close_all();
        Ok(ParsedUsfm {
            nodes: self.out,
            end,
            continues_previous,
            ends_in_table,
            open_sidebar,
        })
    }
}

fn is_table(open: &Open) -> bool {
    open.node.node_type() == NodeType::Table
}

/// Parse `key="value"` pairs. A bare value is stored under `default_key`.
fn parse_attributes(text: &str, default_key: &str) -> Attributes {
    let mut attrs: Attributes = ATTRIBUTE
        .captures_iter(text)
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect();
    let bare = text.trim();
    if attrs.is_empty() && !bare.is_empty() && !bare.contains('=') {
        attrs.insert(default_key.to_string(), bare.to_string());
    }
    attrs
}
