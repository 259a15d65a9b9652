//! Rich-text operations and composition.
//!
//! Follows the usual insert/retain/delete model: a document is a delta made
//! only of inserts; a change is a delta of retains, deletes and inserts
//! against it. Text lengths are counted in characters and every embed counts
//! as one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub type AttributeMap = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum InsertValue {
    Text(String),
    Embed(AttributeMap),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Insert(InsertValue),
    Retain(usize),
    Delete(usize),
}

/// One operation. Empty attribute maps are stored as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOp", into = "RawOp")]
pub struct Op {
    pub kind: OpKind,
    pub attributes: Option<AttributeMap>,
}

/// Wire shape: `{"insert": "text" | {embed}, "attributes": {...}}`,
/// `{"retain": n}` or `{"delete": n}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    insert: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retain: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delete: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attributes: Option<AttributeMap>,
}

impl TryFrom<RawOp> for Op {
    type Error = String;

    fn try_from(raw: RawOp) -> Result<Self, Self::Error> {
        let kind = match (raw.insert, raw.retain, raw.delete) {
            (Some(Value::String(text)), None, None) => OpKind::Insert(InsertValue::Text(text)),
            (Some(Value::Object(embed)), None, None) => OpKind::Insert(InsertValue::Embed(embed)),
            (Some(other), None, None) => return Err(format!("cannot insert {other}")),
            (None, Some(count), None) => OpKind::Retain(count),
            (None, None, Some(count)) => OpKind::Delete(count),
            _ => return Err("op must have exactly one of insert, retain or delete".to_string()),
        };
        Ok(Op::with_attributes(kind, raw.attributes))
    }
}

impl From<Op> for RawOp {
    fn from(op: Op) -> Self {
        let mut raw = RawOp {
            insert: None,
            retain: None,
            delete: None,
            attributes: op.attributes,
        };
        match op.kind {
            OpKind::Insert(InsertValue::Text(text)) => raw.insert = Some(Value::String(text)),
            OpKind::Insert(InsertValue::Embed(embed)) => raw.insert = Some(Value::Object(embed)),
            OpKind::Retain(count) => raw.retain = Some(count),
            OpKind::Delete(count) => raw.delete = Some(count),
        }
        raw
    }
}

impl Op {
    fn with_attributes(kind: OpKind, attributes: Option<AttributeMap>) -> Self {
        Self {
            kind,
            attributes: attributes.filter(|attrs| !attrs.is_empty()),
        }
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self::with_attributes(OpKind::Insert(InsertValue::Text(text.into())), None)
    }

    pub fn insert_with(text: impl Into<String>, attributes: Value) -> Self {
        Self::with_attributes(
            OpKind::Insert(InsertValue::Text(text.into())),
            as_map(attributes),
        )
    }

    /// Insert an embed such as `{"verse": {"number": "1"}}`.
    pub fn embed(embed: Value) -> Self {
        Self::embed_with(embed, Value::Null)
    }

    pub fn embed_with(embed: Value, attributes: Value) -> Self {
        let embed = as_map(embed).unwrap_or_default();
        Self::with_attributes(OpKind::Insert(InsertValue::Embed(embed)), as_map(attributes))
    }

    pub fn retain(count: usize) -> Self {
        Self::with_attributes(OpKind::Retain(count), None)
    }

    pub fn retain_with(count: usize, attributes: Value) -> Self {
        Self::with_attributes(OpKind::Retain(count), as_map(attributes))
    }

    pub fn delete(count: usize) -> Self {
        Self::with_attributes(OpKind::Delete(count), None)
    }

    /// Length in characters. Embeds count as one.
    pub fn len(&self) -> usize {
        match &self.kind {
            OpKind::Insert(InsertValue::Text(text)) => text.chars().count(),
            OpKind::Insert(InsertValue::Embed(_)) => 1,
            OpKind::Retain(count) | OpKind::Delete(count) => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert(_))
    }
}

fn as_map(value: Value) -> Option<AttributeMap> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Position inside an op stream: op index plus characters already consumed
/// from that op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpCursor {
    pub index: usize,
    pub skip: usize,
}

/// An ordered op stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<Op>,
}

impl From<Vec<Op>> for Delta {
    fn from(ops: Vec<Op>) -> Self {
        Self { ops }
    }
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"ops": [...]}` or a bare op array.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let delta = match value {
            Value::Array(_) => Delta {
                ops: serde_json::from_value(value)?,
            },
            _ => serde_json::from_value(value)?,
        };
        Ok(delta)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Total length in characters.
    pub fn char_len(&self) -> usize {
        self.ops.iter().map(Op::len).sum()
    }

    /// Builder form of [`Delta::push`].
    pub fn with(mut self, op: Op) -> Self {
        self.push(op);
        self
    }

    /// Append an op, merging it with the last one where possible.
    pub fn push(&mut self, op: Op) {
        if op.is_empty() {
            return;
        }
        let mut index = self.ops.len();
        if let Some(last) = self.ops.last_mut() {
            if let (OpKind::Delete(total), OpKind::Delete(count)) = (&mut last.kind, &op.kind) {
                *total += count;
                return;
            }
            // Inserts go before a trailing delete.
            if matches!(last.kind, OpKind::Delete(_)) && op.is_insert() {
                index -= 1;
            }
        }
        if index > 0 {
            let previous = &mut self.ops[index - 1];
            if previous.attributes == op.attributes {
                match (&mut previous.kind, &op.kind) {
                    (
                        OpKind::Insert(InsertValue::Text(text)),
                        OpKind::Insert(InsertValue::Text(more)),
                    ) => {
                        text.push_str(more);
                        return;
                    }
                    (OpKind::Retain(total), OpKind::Retain(count)) => {
                        *total += count;
                        return;
                    }
                    _ => {}
                }
            }
        }
        self.ops.insert(index, op);
    }

    /// Rebuild with adjacent mergeable ops joined.
    pub fn compact(self) -> Delta {
        self.ops.into_iter().fold(Delta::new(), Delta::with)
    }

    /// Drop a trailing plain retain.
    pub fn chop(mut self) -> Self {
        if let Some(Op {
            kind: OpKind::Retain(_),
            attributes: None,
        }) = self.ops.last()
        {
            self.ops.pop();
        }
        self
    }

    /// Apply `change` on top of this delta.
    pub fn compose(&self, change: &Delta) -> Delta {
        let mut this = OpIter::new(&self.ops);
        let mut other = OpIter::new(&change.ops);
        let mut ops = Vec::new();

        // Copy the untouched prefix verbatim so op indices before the first
        // edit stay valid.
        if let Some(Op {
            kind: OpKind::Retain(first_retain),
            attributes: None,
        }) = change.ops.first()
        {
            let mut left = *first_retain;
            while this.peek_is_insert() && this.peek_len() <= left {
                left -= this.peek_len();
                ops.push(this.next(usize::MAX));
            }
            if first_retain - left > 0 {
                other.next(first_retain - left);
            }
        }

        let mut delta = Delta { ops };
        while this.has_next() || other.has_next() {
            if other.peek_is_insert() {
                delta.push(other.next(usize::MAX));
            } else if this.peek_is_delete() {
                delta.push(this.next(usize::MAX));
            } else {
                let length = this.peek_len().min(other.peek_len());
                let this_op = this.next(length);
                let other_op = other.next(length);
                match other_op.kind {
                    OpKind::Retain(_) => {
                        let keep_null = matches!(this_op.kind, OpKind::Retain(_));
                        let attributes = compose_attributes(
                            this_op.attributes.as_ref(),
                            other_op.attributes.as_ref(),
                            keep_null,
                        );
                        let kind = match this_op.kind {
                            OpKind::Retain(_) => OpKind::Retain(length),
                            kind => kind,
                        };
                        delta.push(Op::with_attributes(kind, attributes));
                    }
                    OpKind::Delete(_) if matches!(this_op.kind, OpKind::Retain(_)) => {
                        delta.push(other_op);
                    }
                    _ => {}
                }
            }
        }
        delta.chop()
    }

    /// Check that this delta only contains inserts, as a document must.
    pub(crate) fn ensure_document(&self) -> Result<()> {
        match self.ops.iter().position(|op| !op.is_insert()) {
            Some(index) => Err(Error::delta(index, "document ops must all be inserts")),
            None => Ok(()),
        }
    }
}

/// Merge attribute maps: keys in `b` win; `null` values are removed unless
/// `keep_null` is set.
pub fn compose_attributes(
    a: Option<&AttributeMap>,
    b: Option<&AttributeMap>,
    keep_null: bool,
) -> Option<AttributeMap> {
    let mut attributes = b.cloned().unwrap_or_default();
    if !keep_null {
        attributes.retain(|_, value| !value.is_null());
    }
    if let Some(a) = a {
        for (key, value) in a {
            if !b.is_some_and(|b| b.contains_key(key)) {
                attributes.insert(key.clone(), value.clone());
            }
        }
    }
    (!attributes.is_empty()).then_some(attributes)
}

struct OpIter<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpIter<'a> {
    fn new(ops: &'a [Op]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.peek_len() < usize::MAX
    }

    fn peek(&self) -> Option<&'a Op> {
        self.ops.get(self.index)
    }

    /// Remaining length of the current op; unbounded once exhausted.
    fn peek_len(&self) -> usize {
        self.peek()
            .map(|op| op.len() - self.offset)
            .unwrap_or(usize::MAX)
    }

    fn peek_is_insert(&self) -> bool {
        self.peek().is_some_and(Op::is_insert)
    }

    fn peek_is_delete(&self) -> bool {
        self.peek()
            .is_some_and(|op| matches!(op.kind, OpKind::Delete(_)))
    }

    /// Take up to `length` characters of the current op. Past the end this
    /// yields an unbounded retain.
    fn next(&mut self, length: usize) -> Op {
        let Some(op) = self.peek() else {
            return Op::retain(usize::MAX);
        };
        let offset = self.offset;
        let op_len = op.len();
        let length = if length >= op_len - offset {
            self.index += 1;
            self.offset = 0;
            op_len - offset
        } else {
            self.offset += length;
            length
        };
        let kind = match &op.kind {
            OpKind::Delete(_) => OpKind::Delete(length),
            OpKind::Retain(_) => OpKind::Retain(length),
            OpKind::Insert(InsertValue::Text(text)) => OpKind::Insert(InsertValue::Text(
                text.chars().skip(offset).take(length).collect(),
            )),
            OpKind::Insert(embed) => OpKind::Insert(embed.clone()),
        };
        Op {
            kind,
            attributes: op.attributes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(ops: Vec<Op>) -> Delta {
        Delta::from(ops)
    }

    #[test]
    fn push_merges_matching_inserts() {
        let delta = Delta::new()
            .with(Op::insert("ab"))
            .with(Op::insert("cd"))
            .with(Op::insert_with("e", json!({"bold": true})));
        assert_eq!(delta.len(), 2);
        assert_eq!(delta.ops[0], Op::insert("abcd"));
    }

    #[test]
    fn push_puts_insert_before_delete() {
        let delta = Delta::new()
            .with(Op::retain(1))
            .with(Op::delete(2))
            .with(Op::insert("x"));
        assert_eq!(delta.ops, vec![Op::retain(1), Op::insert("x"), Op::delete(2)]);
    }

    #[test]
    fn compose_insert_in_middle() {
        let base = doc(vec![Op::insert("Hello\n"), Op::insert_with("World", json!({"char": {"style": "w"}}))]);
        let change = doc(vec![Op::retain(5), Op::insert(" there")]);
        let composed = base.compose(&change);
        assert_eq!(
            composed.ops,
            vec![
                Op::insert("Hello there\n"),
                Op::insert_with("World", json!({"char": {"style": "w"}})),
            ]
        );
    }

    #[test]
    fn compose_delete_across_ops() {
        let base = doc(vec![Op::insert("ab"), Op::embed(json!({"verse": {"number": "1"}})), Op::insert("cd")]);
        let change = doc(vec![Op::retain(1), Op::delete(3)]);
        let composed = base.compose(&change);
        assert_eq!(composed.ops, vec![Op::insert("ad")]);
    }

    #[test]
    fn compose_retain_sets_and_clears_attributes() {
        let base = doc(vec![Op::insert_with("abc", json!({"bold": true}))]);
        let change = doc(vec![Op::retain_with(2, json!({"bold": null, "italic": true}))]);
        let composed = base.compose(&change);
        assert_eq!(
            composed.ops,
            vec![
                Op::insert_with("ab", json!({"italic": true})),
                Op::insert_with("c", json!({"bold": true})),
            ]
        );
    }

    #[test]
    fn compose_keeps_untouched_prefix_ops() {
        let base = doc(vec![
            Op::insert("a\n"),
            Op::insert_with("\n", json!({"para": {"style": "s"}})),
            Op::insert("tail\n"),
        ]);
        let change = doc(vec![Op::retain(5), Op::insert("X")]);
        let composed = base.compose(&change);
        assert_eq!(composed.ops[0], base.ops[0]);
        assert_eq!(composed.ops[1], base.ops[1]);
        assert_eq!(composed.ops[2], Op::insert("taXil\n"));
    }

    #[test]
    fn json_round_trip() {
        let json = r#"{"ops":[{"insert":"Hi"},{"insert":{"verse":{"number":"1"}},"attributes":{"segment":"v1"}},{"retain":3},{"delete":2}]}"#;
        let delta = Delta::from_json(json).unwrap();
        assert_eq!(delta.len(), 4);
        assert_eq!(delta.ops[2], Op::retain(3));
        assert_eq!(delta.to_json(), json);

        let bare = Delta::from_json(r#"[{"insert":"x"}]"#).unwrap();
        assert_eq!(bare.ops, vec![Op::insert("x")]);
    }

    #[test]
    fn json_rejects_invalid_op() {
        assert!(Delta::from_json(r#"[{"insert":"x","delete":1}]"#).is_err());
        assert!(Delta::from_json(r#"[{"insert":5}]"#).is_err());
    }
}
