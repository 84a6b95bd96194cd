//! Table version tags.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The version of a table as last observed from the server.
///
/// Each field is an opaque ETag. A missing ETag is `None` and never compares
/// equal to any string, the empty string included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncTag {
    /// Version of the row contents.
    #[serde(rename = "dataETag", default)]
    pub data_etag: Option<String>,
    /// Version of the table properties.
    #[serde(rename = "propertiesETag", default)]
    pub properties_etag: Option<String>,
    /// Version of the table schema.
    #[serde(rename = "schemaETag", default)]
    pub schema_etag: Option<String>,
}

impl SyncTag {
    /// Creates a tag from its three parts.
    pub fn new(
        data_etag: Option<String>,
        properties_etag: Option<String>,
        schema_etag: Option<String>,
    ) -> Self {
        Self {
            data_etag,
            properties_etag,
            schema_etag,
        }
    }

    /// A tag for a table that has never been synchronized.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if no ETag has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.data_etag.is_none() && self.properties_etag.is_none() && self.schema_etag.is_none()
    }

    /// Returns a copy with the data ETag replaced.
    pub fn with_data_etag(mut self, data_etag: Option<String>) -> Self {
        self.data_etag = data_etag;
        self
    }

    /// Returns a copy with the properties ETag replaced.
    pub fn with_properties_etag(mut self, properties_etag: Option<String>) -> Self {
        self.properties_etag = properties_etag;
        self
    }

    /// Returns a copy with the schema ETag replaced.
    pub fn with_schema_etag(mut self, schema_etag: Option<String>) -> Self {
        self.schema_etag = schema_etag;
        self
    }

    /// Returns true if both tags name the same row contents.
    pub fn same_data(&self, other: &SyncTag) -> bool {
        self.data_etag == other.data_etag
    }

    /// Serializes the tag into its persisted JSON form.
    pub fn to_json_string(&self) -> String {
        // Three optional strings cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    /// Parses a persisted tag. Blank input yields the empty tag.
    pub fn from_json_str(s: &str) -> ProtocolResult<Self> {
        if s.trim().is_empty() {
            return Ok(Self::empty());
        }
        serde_json::from_str(s).map_err(|e| ProtocolError::InvalidSyncTag(e.to_string()))
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json_string())
    }
}

impl FromStr for SyncTag {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_json_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn null_is_not_empty_string() {
        let absent = SyncTag::empty();
        let blank = SyncTag::empty().with_data_etag(Some(String::new()));
        assert_ne!(absent, blank);
        assert!(!absent.same_data(&blank));
        assert!(absent.same_data(&SyncTag::empty()));
    }

    #[test]
    fn blank_input_is_empty_tag() {
        assert_eq!(SyncTag::from_json_str("").unwrap(), SyncTag::empty());
        assert_eq!(SyncTag::from_json_str("   ").unwrap(), SyncTag::empty());
    }

    #[test]
    fn wire_field_names() {
        let tag = SyncTag::new(Some("d1".into()), None, Some("s1".into()));
        let json = tag.to_json_string();
        assert!(json.contains("\"dataETag\":\"d1\""));
        assert!(json.contains("\"propertiesETag\":null"));
        assert!(json.contains("\"schemaETag\":\"s1\""));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            "not json".parse::<SyncTag>(),
            Err(ProtocolError::InvalidSyncTag(_))
        ));
    }

    proptest! {
        #[test]
        fn persisted_form_preserves_nulls(
            data in proptest::option::of(".{0,8}"),
            props in proptest::option::of(".{0,8}"),
            schema in proptest::option::of(".{0,8}"),
        ) {
            let tag = SyncTag::new(data, props, schema);
            let parsed: SyncTag = tag.to_string().parse().unwrap();
            prop_assert_eq!(parsed, tag);
        }
    }
}
