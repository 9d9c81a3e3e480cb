use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

/// Stable local identifier of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl ItemId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .trim_start_matches('#')
            .parse::<u64>()
            .ok()
            .filter(|raw| *raw > 0)
            .map(Self)
            .ok_or_else(|| ParseEnumError {
                expected: "item id",
                got: s.to_string(),
            })
    }
}

/// Name of the remote endpoint that owns an item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute identifier, e.g. `status` or `summary`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrId(String);

impl AttrId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AttrId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for AttrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed attribute value.
///
/// Structural equality (`==`) compares references by identity. The diff engine
/// applies value semantics on top of it, see [`crate::diff`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Text(String),
    Int(i64),
    Bool(bool),
    Ref(ItemId),
    List(Vec<Value>),
}

impl Value {
    /// Parse a command-line style literal: integers, `true`/`false`,
    /// `#<id>` item references, everything else is text.
    #[must_use]
    pub fn parse_literal(raw: &str) -> Self {
        if let Ok(int) = raw.parse::<i64>() {
            return Self::Int(int);
        }
        match raw {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Some(id) = raw.strip_prefix('#').and_then(|rest| rest.parse::<u64>().ok()) {
            return Self::Ref(ItemId::new(id));
        }
        Self::Text(raw.to_string())
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Int(int) => write!(f, "{int}"),
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Ref(id) => write!(f, "#{id}"),
            Self::List(values) => {
                f.write_str("[")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<i64> for Value {
    fn from(int: i64) -> Self {
        Self::Int(int)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Self::Bool(flag)
    }
}

impl From<ItemId> for Value {
    fn from(id: ItemId) -> Self {
        Self::Ref(id)
    }
}

/// Attribute-id to value mapping. An attribute that is not present has no value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap(BTreeMap<AttrId, Value>);

impl AttributeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, attr: &AttrId) -> Option<&Value> {
        self.0.get(attr)
    }

    pub fn set(&mut self, attr: impl Into<AttrId>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(attr.into(), value.into())
    }

    /// Set or clear an attribute in one call.
    pub fn put(&mut self, attr: AttrId, value: Option<Value>) {
        match value {
            Some(value) => {
                self.0.insert(attr, value);
            }
            None => {
                self.0.remove(&attr);
            }
        }
    }

    pub fn remove(&mut self, attr: &AttrId) -> Option<Value> {
        self.0.remove(attr)
    }

    #[must_use]
    pub fn contains(&self, attr: &AttrId) -> bool {
        self.0.contains_key(attr)
    }

    pub fn keys(&self) -> impl Iterator<Item = &AttrId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttrId, &Value)> {
        self.0.iter()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&AttrId, &Value) -> bool) {
        self.0.retain(|attr, value| keep(attr, value));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builder-style setter used heavily by tests and callers assembling values.
    #[must_use]
    pub fn with(mut self, attr: impl Into<AttrId>, value: impl Into<Value>) -> Self {
        self.set(attr, value);
        self
    }
}

impl FromIterator<(AttrId, Value)> for AttributeMap {
    fn from_iter<I: IntoIterator<Item = (AttrId, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for AttributeMap {
    type Item = (AttrId, Value);
    type IntoIter = std::collections::btree_map::IntoIter<AttrId, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The three server-side shadow slots kept beside the trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowKind {
    /// Last value acknowledged by the server; the merge ancestor.
    Base,
    /// Server value that collided with unsynced local edits.
    Conflict,
    /// Freshly fetched server value not yet merged.
    Download,
}

impl ShadowKind {
    pub const ALL: [Self; 3] = [Self::Base, Self::Conflict, Self::Download];

    const fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Conflict => "conflict",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for ShadowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShadowKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "conflict" => Ok(Self::Conflict),
            "download" => Ok(Self::Download),
            _ => Err(ParseEnumError {
                expected: "shadow kind",
                got: s.to_string(),
            }),
        }
    }
}

/// Everything stored for one item: the trunk plus reserved shadow slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ItemId>,
    pub trunk: AttributeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<AttributeMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<AttributeMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<AttributeMap>,
    /// Wall-clock time of the last local edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl ItemRecord {
    /// A locally created item: trunk only, never seen by a server.
    #[must_use]
    pub fn new_local(
        id: ItemId,
        connection: Option<ConnectionId>,
        parent: Option<ItemId>,
        trunk: AttributeMap,
    ) -> Self {
        Self {
            id,
            connection,
            parent,
            trunk,
            base: None,
            conflict: None,
            download: None,
            edited_at: None,
        }
    }

    #[must_use]
    pub const fn shadow(&self, kind: ShadowKind) -> Option<&AttributeMap> {
        match kind {
            ShadowKind::Base => self.base.as_ref(),
            ShadowKind::Conflict => self.conflict.as_ref(),
            ShadowKind::Download => self.download.as_ref(),
        }
    }

    pub fn set_shadow(&mut self, kind: ShadowKind, value: Option<AttributeMap>) {
        match kind {
            ShadowKind::Base => self.base = value,
            ShadowKind::Conflict => self.conflict = value,
            ShadowKind::Download => self.download = value,
        }
    }

    /// Created locally and not yet known to any server.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.base.is_none() && self.conflict.is_none() && self.download.is_none()
    }

    /// Newest server knowledge: download, then conflict, then base.
    #[must_use]
    pub fn last_server(&self) -> Option<&AttributeMap> {
        self.download
            .as_ref()
            .or(self.conflict.as_ref())
            .or(self.base.as_ref())
    }
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_parses_with_or_without_hash() {
        assert_eq!("42".parse::<ItemId>(), Ok(ItemId::new(42)));
        assert_eq!("#42".parse::<ItemId>(), Ok(ItemId::new(42)));
        assert!("0".parse::<ItemId>().is_err());
        assert!("abc".parse::<ItemId>().is_err());
    }

    #[test]
    fn literal_parsing_covers_all_scalar_kinds() {
        assert_eq!(Value::parse_literal("7"), Value::Int(7));
        assert_eq!(Value::parse_literal("true"), Value::Bool(true));
        assert_eq!(Value::parse_literal("#12"), Value::Ref(ItemId::new(12)));
        assert_eq!(Value::parse_literal("open"), Value::Text("open".into()));
    }

    #[test]
    fn last_server_prefers_download_then_conflict_then_base() {
        let base = AttributeMap::new().with("status", "open");
        let conflict = AttributeMap::new().with("status", "reopened");
        let download = AttributeMap::new().with("status", "closed");

        let mut record = ItemRecord::new_local(ItemId::new(1), None, None, base.clone());
        assert!(record.is_new());
        assert!(record.last_server().is_none());

        record.base = Some(base.clone());
        assert_eq!(record.last_server(), Some(&base));
        record.conflict = Some(conflict.clone());
        assert_eq!(record.last_server(), Some(&conflict));
        record.download = Some(download.clone());
        assert_eq!(record.last_server(), Some(&download));
        assert!(!record.is_new());
    }

    #[test]
    fn record_json_keeps_reserved_shadow_slots() {
        let mut record = ItemRecord::new_local(
            ItemId::new(3),
            Some(ConnectionId::new("jira")),
            None,
            AttributeMap::new().with("summary", "Crash on start"),
        );
        record.base = Some(AttributeMap::new().with("summary", "Crash"));

        let json = serde_json::to_value(&record).expect("serialize record");
        assert!(json.get("base").is_some());
        assert!(json.get("conflict").is_none());

        let back: ItemRecord = serde_json::from_value(json).expect("deserialize record");
        assert_eq!(back, record);
    }

    #[test]
    fn shadow_kind_round_trips_through_text() {
        for kind in ShadowKind::ALL {
            assert_eq!(kind.to_string().parse::<ShadowKind>(), Ok(kind));
        }
    }
}
