//! Per-item shadow set: the trunk plus the base, conflict and download slots.

use crate::error::{Result, SyncError};
use crate::model::item::{AttributeMap, ItemId, ItemRecord, ShadowKind};
use crate::model::schema::Schema;
use crate::store::ItemSource;

/// The working value of an item.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if the item does not exist.
pub fn read_trunk<S: ItemSource + ?Sized>(source: &S, item: ItemId) -> Result<&AttributeMap> {
    source
        .item(item)
        .map(|record| &record.trunk)
        .ok_or(SyncError::ItemNotFound(item))
}

/// One shadow slot. `Ok(None)` means the slot is empty.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if the item does not exist.
pub fn read_shadow<S: ItemSource + ?Sized>(
    source: &S,
    item: ItemId,
    kind: ShadowKind,
) -> Result<Option<&AttributeMap>> {
    source
        .item(item)
        .map(|record| record.shadow(kind))
        .ok_or(SyncError::ItemNotFound(item))
}

/// Newest server knowledge: download, then conflict, then base.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if the item does not exist.
pub fn last_server<S: ItemSource + ?Sized>(
    source: &S,
    item: ItemId,
) -> Result<Option<&AttributeMap>> {
    source
        .item(item)
        .map(ItemRecord::last_server)
        .ok_or(SyncError::ItemNotFound(item))
}

/// Store a shadow slot, keeping only shadowable attributes.
pub fn write_shadow(
    record: &mut ItemRecord,
    schema: &Schema,
    kind: ShadowKind,
    values: Option<&AttributeMap>,
) {
    record.set_shadow(kind, values.map(|values| schema.shadowable_part(values)));
}

/// Trunk whose shadowable part is replaced by `server`; trunk-only attributes survive.
#[must_use]
pub fn trunk_from_server(
    trunk: &AttributeMap,
    server: &AttributeMap,
    schema: &Schema,
) -> AttributeMap {
    let mut next: AttributeMap = trunk
        .iter()
        .filter(|(attr, _)| !schema.is_shadowable(attr))
        .map(|(attr, value)| (attr.clone(), value.clone()))
        .collect();
    for (attr, value) in server.iter() {
        if schema.is_shadowable(attr) {
            next.set(attr.clone(), value.clone());
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::AttrKind;
    use crate::store::Snapshot;

    fn schema() -> Schema {
        Schema::new().derived("summary_html", AttrKind::Text)
    }

    #[test]
    fn missing_item_is_reported() {
        let snapshot = Snapshot::empty();
        assert!(matches!(
            read_trunk(&snapshot, ItemId::new(4)),
            Err(SyncError::ItemNotFound(id)) if id == ItemId::new(4)
        ));
        assert!(last_server(&snapshot, ItemId::new(4)).is_err());
    }

    #[test]
    fn empty_slot_reads_as_none() {
        let record = ItemRecord::new_local(
            ItemId::new(1),
            None,
            None,
            AttributeMap::new().with("status", "open"),
        );
        let snapshot = Snapshot::from_records(0, [record]);
        assert_eq!(
            read_shadow(&snapshot, ItemId::new(1), ShadowKind::Base).expect("item exists"),
            None
        );
    }

    #[test]
    fn written_shadows_drop_trunk_only_attributes() {
        let mut record = ItemRecord::new_local(ItemId::new(1), None, None, AttributeMap::new());
        let server = AttributeMap::new()
            .with("status", "open")
            .with("summary_html", "<b>x</b>");

        write_shadow(&mut record, &schema(), ShadowKind::Download, Some(&server));
        assert_eq!(record.download, Some(AttributeMap::new().with("status", "open")));
    }

    #[test]
    fn server_values_replace_only_shadowable_trunk() {
        let trunk = AttributeMap::new()
            .with("status", "open")
            .with("priority", 2)
            .with("summary_html", "<p>old</p>");
        let server = AttributeMap::new().with("status", "closed");

        let next = trunk_from_server(&trunk, &server, &schema());
        assert_eq!(
            next,
            AttributeMap::new()
                .with("status", "closed")
                .with("summary_html", "<p>old</p>")
        );
    }
}
