pub mod item;
pub mod schema;

pub use item::{AttrId, AttributeMap, ConnectionId, ItemId, ItemRecord, ShadowKind, Value};
pub use schema::{AttrDef, AttrKind, Schema};
