//! Attribute schema: which attributes participate in shadow tracking.
//!
//! Derived or internal attributes (rendered HTML, search text, cached
//! counters) live on the trunk only. Every attribute the schema does not know
//! is shadowable, so a new server field is tracked without a schema change.

use std::collections::BTreeMap;

use super::item::{AttrId, AttributeMap, Value};

/// Declared value kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Text,
    Int,
    Bool,
    Reference,
    List,
    /// No constraint on the value.
    Any,
}

impl AttrKind {
    /// Whether `value` is acceptable for an attribute of this kind.
    #[must_use]
    pub const fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Any, _)
                | (Self::Text, Value::Text(_))
                | (Self::Int, Value::Int(_))
                | (Self::Bool, Value::Bool(_))
                | (Self::Reference, Value::Ref(_))
                | (Self::List, Value::List(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrDef {
    pub id: AttrId,
    pub kind: AttrKind,
    pub shadowable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    attrs: BTreeMap<AttrId, AttrDef>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a shadowable attribute.
    #[must_use]
    pub fn attr(mut self, id: impl Into<AttrId>, kind: AttrKind) -> Self {
        let id = id.into();
        self.attrs.insert(
            id.clone(),
            AttrDef {
                id,
                kind,
                shadowable: true,
            },
        );
        self
    }

    /// Declare a trunk-only attribute.
    #[must_use]
    pub fn derived(mut self, id: impl Into<AttrId>, kind: AttrKind) -> Self {
        let id = id.into();
        self.attrs.insert(
            id.clone(),
            AttrDef {
                id,
                kind,
                shadowable: false,
            },
        );
        self
    }

    #[must_use]
    pub fn get(&self, id: &AttrId) -> Option<&AttrDef> {
        self.attrs.get(id)
    }

    #[must_use]
    pub fn is_shadowable(&self, id: &AttrId) -> bool {
        self.attrs.get(id).is_none_or(|def| def.shadowable)
    }

    /// Copy of `values` restricted to shadowable attributes.
    #[must_use]
    pub fn shadowable_part(&self, values: &AttributeMap) -> AttributeMap {
        values
            .iter()
            .filter(|(attr, _)| self.is_shadowable(attr))
            .map(|(attr, value)| (attr.clone(), value.clone()))
            .collect()
    }

    /// First attribute in `values` whose value does not match its declared kind.
    #[must_use]
    pub fn first_invalid<'a>(&self, values: &'a AttributeMap) -> Option<(&'a AttrId, &'a Value)> {
        values.iter().find(|(attr, value)| {
            self.attrs
                .get(*attr)
                .is_some_and(|def| !def.kind.accepts(value))
        })
    }

    pub fn definitions(&self) -> impl Iterator<Item = &AttrDef> {
        self.attrs.values()
    }
}
