//! Protected entity identifiers.
//!
//! Canonical form is `type:instanceId[:snapshotId]`. Neither the type nor the
//! instance id may contain the delimiter; parsing splits into at most three
//! fields, so the snapshot id is the only field that can carry further delimiters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::WardenError;

pub const ID_DELIMITER: char = ':';
const MAX_FIELDS: usize = 3;

/// Backend-opaque snapshot identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh UUID-backed id for a newly created snapshot.
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a live entity or one of its snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    type_name: String,
    instance_id: String,
    snapshot_id: Option<SnapshotId>,
}

impl EntityId {
    /// Live entity id. Fails with `InvalidFormat` when a field is empty or would
    /// not survive a format/parse round trip.
    pub fn new(
        type_name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Result<Self, WardenError> {
        let id = Self {
            type_name: type_name.into(),
            instance_id: instance_id.into(),
            snapshot_id: None,
        };
        id.validate()?;
        Ok(id)
    }

    pub fn with_snapshot_parts(
        type_name: impl Into<String>,
        instance_id: impl Into<String>,
        snapshot_id: SnapshotId,
    ) -> Result<Self, WardenError> {
        Ok(Self::new(type_name, instance_id)?.with_snapshot(snapshot_id))
    }

    fn validate(&self) -> Result<(), WardenError> {
        if self.type_name.is_empty() {
            return Err(WardenError::InvalidFormat("empty entity type".to_string()));
        }
        if self.instance_id.is_empty() {
            return Err(WardenError::InvalidFormat(format!(
                "empty instance id for type {}",
                self.type_name
            )));
        }
        for (field, value) in [("type", &self.type_name), ("instance id", &self.instance_id)] {
            if value.contains(ID_DELIMITER) {
                return Err(WardenError::InvalidFormat(format!(
                    "{field} {value:?} contains '{ID_DELIMITER}'"
                )));
            }
        }
        Ok(())
    }

    pub fn parse(s: &str) -> Result<Self, WardenError> {
        let mut fields = s.splitn(MAX_FIELDS, ID_DELIMITER);
        let type_name = fields.next().unwrap_or_default();
        let instance_id = fields.next().ok_or_else(|| {
            WardenError::InvalidFormat(format!("{s:?} has no '{ID_DELIMITER}' delimiter"))
        })?;
        if type_name.is_empty() {
            return Err(WardenError::InvalidFormat(format!("{s:?} has an empty type")));
        }
        if instance_id.is_empty() {
            return Err(WardenError::InvalidFormat(format!(
                "{s:?} has an empty instance id"
            )));
        }
        let snapshot_id = match fields.next() {
            Some("") => {
                return Err(WardenError::InvalidFormat(format!(
                    "{s:?} has an empty snapshot id"
                )))
            }
            Some(snap) => Some(SnapshotId::new(snap)),
            None => None,
        };
        Ok(Self {
            type_name: type_name.to_string(),
            instance_id: instance_id.to_string(),
            snapshot_id,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn snapshot_id(&self) -> Option<&SnapshotId> {
        self.snapshot_id.as_ref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot_id.is_some()
    }

    pub fn with_snapshot(&self, snapshot_id: SnapshotId) -> Self {
        Self {
            snapshot_id: Some(snapshot_id),
            ..self.clone()
        }
    }

    pub fn without_snapshot(&self) -> Self {
        Self {
            snapshot_id: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ID_DELIMITER}{}", self.type_name, self.instance_id)?;
        if let Some(snap) = &self.snapshot_id {
            write!(f, "{ID_DELIMITER}{snap}")?;
        }
        Ok(())
    }
}

impl FromStr for EntityId {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_live_and_snapshot() {
        let live = EntityId::parse("psql:3f2c-uid").unwrap();
        assert_eq!(live.type_name(), "psql");
        assert_eq!(live.instance_id(), "3f2c-uid");
        assert!(!live.has_snapshot());

        let snap = EntityId::parse("psql:3f2c-uid:9a1e").unwrap();
        assert_eq!(snap.snapshot_id().map(SnapshotId::as_str), Some("9a1e"));
        assert_eq!(snap.without_snapshot(), live);
        assert_ne!(snap, live);
    }

    #[test]
    fn test_trailing_field_keeps_delimiters() {
        let id = EntityId::parse("fs:file.txt:snap:with:colons").unwrap();
        assert_eq!(id.instance_id(), "file.txt");
        assert_eq!(id.snapshot_id().unwrap().as_str(), "snap:with:colons");
        assert_eq!(id.to_string(), "fs:file.txt:snap:with:colons");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "psql", ":abc", "psql:", "::", "psql:abc:"] {
            let err = EntityId::parse(bad).unwrap_err();
            assert!(
                matches!(err, WardenError::InvalidFormat(_)),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_with_snapshot_round_trip() {
        let id = EntityId::new("fs", "notes.txt").unwrap();
        let snap = id.with_snapshot(SnapshotId::new("s1"));
        assert!(snap.has_snapshot());
        assert_eq!(snap.without_snapshot(), id);
    }

    #[test]
    fn test_serde_as_string() {
        let id = EntityId::parse("psql:abc:def").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"psql:abc:def\"");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<EntityId>("\"nodelimiter\"").is_err());
    }

    #[test]
    fn test_constructors_reject_unformattable_fields() {
        for (type_name, instance) in [("fs", "a:b.txt"), ("ps:ql", "abc"), ("", "abc"), ("fs", "")] {
            let err = EntityId::new(type_name, instance).unwrap_err();
            assert!(matches!(err, WardenError::InvalidFormat(_)));
        }
        assert!(EntityId::with_snapshot_parts("fs", "a:b", SnapshotId::new("s")).is_err());
        let id = EntityId::with_snapshot_parts("fs", "a", SnapshotId::new("s:1")).unwrap();
        assert_eq!(id.to_string(), "fs:a:s:1");
    }

    proptest! {
        #[test]
        fn prop_format_then_parse_is_identity(
            type_name in "[a-z][a-z0-9:-]{0,8}",
            instance in "[A-Za-z0-9._/:-]{1,16}",
            snapshot in proptest::option::of("[A-Za-z0-9:-]{1,16}"),
        ) {
            let built = match snapshot {
                Some(s) => EntityId::with_snapshot_parts(&type_name, &instance, SnapshotId::new(s)),
                None => EntityId::new(&type_name, &instance),
            };
            match built {
                Ok(id) => prop_assert_eq!(EntityId::parse(&id.to_string()).unwrap(), id),
                Err(e) => {
                    prop_assert!(matches!(e, WardenError::InvalidFormat(_)));
                    prop_assert!(type_name.contains(ID_DELIMITER) || instance.contains(ID_DELIMITER));
                }
            }
        }
    }
}
