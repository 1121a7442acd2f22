//! Common identifier types used throughout Driftwood.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Stable identifier of a record within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Create a new RecordId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains a '/'
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidInput("RecordId cannot be empty".to_string()));
        }
        if id.contains('/') {
            return Err(Error::InvalidInput(format!(
                "RecordId cannot contain '/': {}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RecordId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

/// Name of a logical record collection (its "table").
///
/// Names are restricted to ASCII letters, digits, '_' and '-'.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    /// Create a new CollectionName.
    ///
    /// # Errors
    /// - Returns error if the name is empty or has characters outside `[A-Za-z0-9_-]`
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidInput(format!(
                "Invalid collection name: {}",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CollectionName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CollectionName> for String {
    fn from(name: CollectionName) -> Self {
        name.0
    }
}

/// Kind of local mutation recorded in the pending change queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "insert",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(ChangeAction::Insert),
            "update" => Ok(ChangeAction::Update),
            "delete" => Ok(ChangeAction::Delete),
            other => Err(Error::InvalidInput(format!("Unknown change action: {}", other))),
        }
    }
}

/// Identifier of an open conflict: the conflicted record's collection and id.
///
/// Rendered and parsed as `collection/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId {
    pub collection: CollectionName,
    pub record_id: RecordId,
}

impl ConflictId {
    pub fn new(collection: CollectionName, record_id: RecordId) -> Self {
        Self {
            collection,
            record_id,
        }
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.record_id)
    }
}

impl FromStr for ConflictId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (collection, id) = s.split_once('/').ok_or_else(|| {
            Error::InvalidInput(format!("Conflict id must be 'collection/id': {}", s))
        })?;
        Ok(Self::new(CollectionName::new(collection)?, RecordId::new(id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_creation() {
        let id = RecordId::new("a1").unwrap();
        assert_eq!(id.as_str(), "a1");
    }

    #[test]
    fn test_record_id_rejects_empty_and_slash() {
        assert!(RecordId::new("").is_err());
        assert!(RecordId::new("a/b").is_err());
    }

    #[test]
    fn test_collection_name_validation() {
        assert!(CollectionName::new("animals").is_ok());
        assert!(CollectionName::new("health_records-v2").is_ok());
        assert!(CollectionName::new("").is_err());
        assert!(CollectionName::new("drop table").is_err());
        assert!(CollectionName::new("a/b").is_err());
    }

    #[test]
    fn test_change_action_round_trip() {
        for action in [ChangeAction::Insert, ChangeAction::Update, ChangeAction::Delete] {
            assert_eq!(action.as_str().parse::<ChangeAction>().unwrap(), action);
        }
        assert!("upsert".parse::<ChangeAction>().is_err());
    }

    #[test]
    fn test_conflict_id_parse() {
        let id: ConflictId = "animals/a1".parse().unwrap();
        assert_eq!(id.collection.as_str(), "animals");
        assert_eq!(id.record_id.as_str(), "a1");
        assert_eq!(id.to_string(), "animals/a1");

        assert!("animals".parse::<ConflictId>().is_err());
        assert!("/a1".parse::<ConflictId>().is_err());
    }

    #[test]
    fn test_serde_validates_names() {
        let ok: CollectionName = serde_json::from_str("\"animals\"").unwrap();
        assert_eq!(ok.as_str(), "animals");
        assert!(serde_json::from_str::<CollectionName>("\"bad name\"").is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_conflict_id_display_parses_back(
            collection in "[A-Za-z0-9_-]{1,16}",
            record in "[^/]{1,24}",
        ) {
            let id = ConflictId::new(
                CollectionName::new(collection).unwrap(),
                RecordId::new(record).unwrap(),
            );
            let parsed: ConflictId = id.to_string().parse().unwrap();
            proptest::prop_assert_eq!(parsed, id);
        }

        #[test]
        fn prop_collection_names_reject_separators(prefix in "[a-z]{0,6}", suffix in "[a-z]{0,6}") {
            let name = format!("{}/{}", prefix, suffix);
            proptest::prop_assert!(CollectionName::new(name).is_err());
        }
    }
}
