//! Rich-text op stream documents.

mod op;
mod parser;
mod reconcile;

pub use op::{compose_attributes, AttributeMap, Delta, InsertValue, Op, OpCursor, OpKind};
pub use reconcile::DeltaReconciler;
