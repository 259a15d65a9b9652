//! USFM marker classification.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::settings::UsfmSettings;
use crate::tree::CellAlign;

/// How the parser treats a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Book,
    Chapter,
    ChapterAlt,
    ChapterPub,
    Verse,
    VerseAlt,
    VersePub,
    Paragraph,
    Character,
    /// Character markers inside notes (`\ft`, `\xo`, ...). Each one ends the
    /// previous one.
    NoteCharacter,
    Note,
    Milestone,
    Row,
    Cell,
    SidebarStart,
    SidebarEnd,
    Category,
    Ref,
}

impl MarkerKind {
    /// Markers before which a text run drops its trailing whitespace.
    pub fn trims_preceding_text(self) -> bool {
        matches!(self, MarkerKind::Book | MarkerKind::Chapter | MarkerKind::Paragraph)
    }
}

const PARAGRAPHS: &[&str] = &[
    "ide", "sts", "rem", "h", "toc", "toca", "usfm", "imt", "imte", "is", "ip", "ipi", "im",
    "imi", "ipq", "imq", "ipr", "iq", "ib", "ili", "iot", "io", "iex", "ie", "mt", "mte", "ms",
    "mr", "s", "sr", "r", "d", "sp", "sd", "cl", "cd", "p", "m", "po", "pr", "cls", "pmo", "pm",
    "pmc", "pmr", "pi", "mi", "nb", "pc", "ph", "q", "qr", "qc", "qa", "qm", "qd", "lh", "li",
    "lf", "lim", "lit", "b", "periph",
];

const CHARACTERS: &[&str] = &[
    "add", "bk", "dc", "k", "nd", "ord", "pn", "png", "addpn", "qt", "sig", "sls", "tl", "wj",
    "em", "bd", "it", "bdit", "no", "sc", "sup", "w", "wg", "wh", "wa", "rb", "rq", "qs", "qac",
    "litl", "lik", "liv", "fig", "ndx", "pro", "jmp", "ior", "iqt",
];

const NOTE_CHARACTERS: &[&str] = &[
    "fr", "fq", "fqa", "fk", "fl", "fw", "fp", "fv", "ft", "fdc", "fm", "xo", "xk", "xq", "xt",
    "xta", "xop", "xot", "xnt", "xdc",
];

const NOTES: &[&str] = &["f", "fe", "ef", "x", "ex"];

static CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(t[hc]([rc]?)(\d+))(?:-(\d+))?$").unwrap());

/// Classify a marker name (without backslash, `+` or `*`).
///
/// Settings win over the built-in tables. Unknown markers are paragraphs when
/// nothing follows them on their line and character markers otherwise.
pub fn classify(name: &str, settings: &UsfmSettings, line_end: bool) -> MarkerKind {
    if let Some(&kind) = settings.markers.get(name) {
        return kind;
    }
    match name {
        "id" => return MarkerKind::Book,
        "c" => return MarkerKind::Chapter,
        "ca" => return MarkerKind::ChapterAlt,
        "cp" => return MarkerKind::ChapterPub,
        "v" => return MarkerKind::Verse,
        "va" => return MarkerKind::VerseAlt,
        "vp" => return MarkerKind::VersePub,
        "tr" => return MarkerKind::Row,
        "esb" => return MarkerKind::SidebarStart,
        "esbe" => return MarkerKind::SidebarEnd,
        "cat" => return MarkerKind::Category,
        "ref" => return MarkerKind::Ref,
        _ => {}
    }
    if name.ends_with("-s") || name.ends_with("-e") {
        return MarkerKind::Milestone;
    }
    if CELL.is_match(name) {
        return MarkerKind::Cell;
    }

    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if NOTES.contains(&base) {
        MarkerKind::Note
    } else if NOTE_CHARACTERS.contains(&base) {
        MarkerKind::NoteCharacter
    } else if CHARACTERS.contains(&base) {
        MarkerKind::Character
    } else if PARAGRAPHS.contains(&base) {
        MarkerKind::Paragraph
    } else if line_end {
        MarkerKind::Paragraph
    } else {
        MarkerKind::Character
    }
}

/// Style, alignment and column span of a table cell marker such as `tcr2-3`.
pub(crate) fn cell(name: &str) -> (String, CellAlign, u32) {
    let Some(captures) = CELL.captures(name) else {
        return (name.to_string(), CellAlign::Start, 1);
    };
    let align = match &captures[2] {
        "r" => CellAlign::End,
        "c" => CellAlign::Center,
        _ => CellAlign::Start,
    };
    let first: u32 = captures[3].parse().unwrap_or(1);
    let span = captures
        .get(4)
        .and_then(|last| last.as_str().parse::<u32>().ok())
        .map(|last| last.saturating_sub(first) + 1)
        .unwrap_or(1);
    (captures[1].to_string(), align, span)
}

/// Attribute name used for a bare `|value` on a marker.
pub(crate) fn default_attribute(style: &str) -> &'static str {
    match style {
        "w" => "lemma",
        "rb" => "gloss",
        "xt" => "link-href",
        "fig" => "src",
        _ => "default",
    }
}
