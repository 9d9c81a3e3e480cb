//! Attribute-level differences between two versions of an item.
//!
//! Three rules hold for every comparison:
//!
//! 1. An absent side compares equal to anything. A missing base therefore
//!    never reports local changes, and a missing download never reports
//!    server changes.
//! 2. Equality is value-semantic. Two `Ref` values are equal when they name
//!    the same item, or when the referenced items have equal shadowable trunk
//!    content. Reference cycles are assumed equal on revisit.
//! 3. Trunk-only attributes are never reported.

use std::collections::{BTreeSet, HashSet};

use crate::model::item::{AttrId, AttributeMap, ItemId, ItemRecord, Value};
use crate::model::schema::Schema;
use crate::store::ItemSource;

pub struct DiffEngine<'a, S: ?Sized> {
    schema: &'a Schema,
    source: &'a S,
}

impl<'a, S: ItemSource + ?Sized> DiffEngine<'a, S> {
    pub const fn new(schema: &'a Schema, source: &'a S) -> Self {
        Self { schema, source }
    }

    /// Attributes whose values differ between `a` and `b`.
    pub fn diff(&self, a: Option<&AttributeMap>, b: Option<&AttributeMap>) -> BTreeSet<AttrId> {
        let (Some(a), Some(b)) = (a, b) else {
            return BTreeSet::new();
        };

        let mut visiting = HashSet::new();
        a.keys()
            .chain(b.keys())
            .filter(|attr| self.schema.is_shadowable(attr))
            .filter(|attr| !self.slot_equal(a.get(attr), b.get(attr), &mut visiting))
            .cloned()
            .collect()
    }

    /// Unsynced local edits: trunk against base.
    pub fn local_changes(&self, record: &ItemRecord) -> BTreeSet<AttrId> {
        self.diff(Some(&record.trunk), record.base.as_ref())
    }

    /// Server-side edits in `server` relative to base.
    pub fn server_changes(&self, record: &ItemRecord, server: &AttributeMap) -> BTreeSet<AttrId> {
        self.diff(Some(server), record.base.as_ref())
    }

    /// Value-semantic equality of two attribute values.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        self.value_equal(a, b, &mut HashSet::new())
    }

    fn slot_equal(
        &self,
        a: Option<&Value>,
        b: Option<&Value>,
        visiting: &mut HashSet<(ItemId, ItemId)>,
    ) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => self.value_equal(a, b, visiting),
            _ => false,
        }
    }

    fn value_equal(&self, a: &Value, b: &Value, visiting: &mut HashSet<(ItemId, ItemId)>) -> bool {
        match (a, b) {
            (Value::Ref(x), Value::Ref(y)) => self.refs_equal(*x, *y, visiting),
            (Value::List(xs), Value::List(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys)
                        .all(|(x, y)| self.value_equal(x, y, visiting))
            }
            _ => a == b,
        }
    }

    fn refs_equal(&self, x: ItemId, y: ItemId, visiting: &mut HashSet<(ItemId, ItemId)>) -> bool {
        if x == y {
            return true;
        }
        if !visiting.insert((x, y)) {
            return true;
        }
        let (Some(left), Some(right)) = (self.source.item(x), self.source.item(y)) else {
            return false;
        };
        left.trunk
            .keys()
            .chain(right.trunk.keys())
            .filter(|attr| self.schema.is_shadowable(attr))
            .all(|attr| self.slot_equal(left.trunk.get(attr), right.trunk.get(attr), visiting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::AttrKind;
    use crate::store::Snapshot;

    fn schema() -> Schema {
        Schema::new().derived("summary_html", AttrKind::Text)
    }

    fn attrs(names: &[&str]) -> BTreeSet<AttrId> {
        names.iter().map(|name| AttrId::from(*name)).collect()
    }

    #[test]
    fn absent_side_yields_no_difference() {
        let schema = schema();
        let snapshot = Snapshot::empty();
        let engine = DiffEngine::new(&schema, &snapshot);
        let values = AttributeMap::new().with("status", "open");

        assert!(engine.diff(Some(&values), None).is_empty());
        assert!(engine.diff(None, Some(&values)).is_empty());
        assert!(engine.diff(None, None).is_empty());
    }

    #[test]
    fn diff_is_symmetric_and_covers_missing_keys() {
        let schema = schema();
        let snapshot = Snapshot::empty();
        let engine = DiffEngine::new(&schema, &snapshot);
        let a = AttributeMap::new().with("status", "open").with("priority", 1);
        let b = AttributeMap::new().with("status", "closed").with("assignee", "ana");

        let expected = attrs(&["assignee", "priority", "status"]);
        assert_eq!(engine.diff(Some(&a), Some(&b)), expected);
        assert_eq!(engine.diff(Some(&b), Some(&a)), expected);
    }

    #[test]
    fn trunk_only_attributes_are_ignored() {
        let schema = schema();
        let snapshot = Snapshot::empty();
        let engine = DiffEngine::new(&schema, &snapshot);
        let a = AttributeMap::new().with("summary_html", "<p>a</p>");
        let b = AttributeMap::new().with("summary_html", "<p>b</p>");
        assert!(engine.diff(Some(&a), Some(&b)).is_empty());
    }

    #[test]
    fn references_compare_by_referenced_content() {
        let schema = schema();
        let user = |id: u64, name: &str| {
            ItemRecord::new_local(
                ItemId::new(id),
                None,
                None,
                AttributeMap::new()
                    .with("login", name)
                    .with("summary_html", format!("<i>{id}</i>")),
            )
        };
        let snapshot =
            Snapshot::from_records(0, [user(10, "ana"), user(11, "ana"), user(12, "bo")]);
        let engine = DiffEngine::new(&schema, &snapshot);

        assert!(engine.values_equal(&Value::Ref(ItemId::new(10)), &Value::Ref(ItemId::new(11))));
        assert!(!engine.values_equal(&Value::Ref(ItemId::new(10)), &Value::Ref(ItemId::new(12))));
        assert!(!engine.values_equal(&Value::Ref(ItemId::new(10)), &Value::Ref(ItemId::new(99))));
    }

    #[test]
    fn reference_cycles_terminate() {
        let schema = schema();
        let linked = |id: u64, other: u64| {
            ItemRecord::new_local(
                ItemId::new(id),
                None,
                None,
                AttributeMap::new().with("peer", ItemId::new(other)),
            )
        };
        let snapshot = Snapshot::from_records(0, [linked(1, 2), linked(2, 1)]);
        let engine = DiffEngine::new(&schema, &snapshot);

        assert!(engine.values_equal(&Value::Ref(ItemId::new(1)), &Value::Ref(ItemId::new(2))));
    }
}
