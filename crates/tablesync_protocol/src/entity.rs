//! JSON entities exchanged with the table service.

use crate::tag::SyncTag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// Unique key of the column within its table.
    pub element_key: String,
    /// Display name of the element.
    pub element_name: String,
    /// Declared element type (`string`, `integer`, ...).
    pub element_type: String,
    /// JSON list of child element keys for composite types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_child_element_keys: Option<String>,
}

impl Column {
    /// Creates a plain column whose name equals its key.
    pub fn new(element_key: impl Into<String>, element_type: impl Into<String>) -> Self {
        let element_key = element_key.into();
        Self {
            element_name: element_key.clone(),
            element_key,
            element_type: element_type.into(),
            list_child_element_keys: None,
        }
    }
}

/// Body of a schema-defining request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Table identifier.
    pub table_id: String,
    /// Schema ETag the client believes is current.
    #[serde(rename = "schemaETag", default)]
    pub schema_etag: Option<String>,
    /// Column definitions.
    #[serde(default)]
    pub columns: Vec<Column>,
}

/// A table definition as served by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinitionResource {
    /// The definition itself.
    #[serde(flatten)]
    pub definition: TableDefinition,
    /// Location of this definition.
    #[serde(default)]
    pub self_uri: Option<String>,
    /// Location of the owning table resource.
    #[serde(default)]
    pub table_uri: Option<String>,
}

/// A server table with its current ETags and navigation links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableResource {
    /// Table identifier.
    pub table_id: String,
    /// Human readable name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Current schema ETag.
    #[serde(rename = "schemaETag", default)]
    pub schema_etag: Option<String>,
    /// Current properties ETag.
    #[serde(rename = "propertiesETag", default)]
    pub properties_etag: Option<String>,
    /// Current data ETag.
    #[serde(rename = "dataETag", default)]
    pub data_etag: Option<String>,
    /// Location of this resource.
    pub self_uri: String,
    /// Location of the table definition.
    pub definition_uri: String,
    /// Location of the row collection.
    pub data_uri: String,
    /// Location of the incremental row diff.
    pub diff_uri: String,
    /// Location of the table properties.
    pub properties_uri: String,
}

impl TableResource {
    /// The server's tag for this table.
    pub fn sync_tag(&self) -> SyncTag {
        SyncTag::new(
            self.data_etag.clone(),
            self.properties_etag.clone(),
            self.schema_etag.clone(),
        )
    }
}

/// Response of the table listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableResourceList {
    /// All tables visible to the caller.
    #[serde(default)]
    pub tables: Vec<TableResource>,
}

/// Visibility filter attached to a row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterScope {
    /// Filter kind.
    #[serde(rename = "type", default)]
    pub filter_type: Option<String>,
    /// Filter argument.
    #[serde(default)]
    pub value: Option<String>,
}

/// A row as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    /// Stable row identifier.
    pub row_id: String,
    /// Row version; `None` for a row the server has never seen.
    #[serde(rename = "rowETag", default)]
    pub row_etag: Option<String>,
    /// True if the server holds this row as deleted.
    #[serde(default)]
    pub deleted: bool,
    /// Form that produced the row.
    #[serde(default)]
    pub form_id: Option<String>,
    /// Locale of the edit.
    #[serde(default)]
    pub locale: Option<String>,
    /// Savepoint type name.
    #[serde(default)]
    pub savepoint_type: Option<String>,
    /// Savepoint timestamp.
    #[serde(default)]
    pub savepoint_timestamp: Option<String>,
    /// Savepoint creator.
    #[serde(default)]
    pub savepoint_creator: Option<String>,
    /// Visibility filter.
    #[serde(default)]
    pub filter_scope: FilterScope,
    /// Column values keyed by element key.
    #[serde(default)]
    pub values: BTreeMap<String, Option<String>>,
}

impl Row {
    /// Creates a live row with the given values and no metadata.
    pub fn new(row_id: impl Into<String>, values: BTreeMap<String, Option<String>>) -> Self {
        Self {
            row_id: row_id.into(),
            row_etag: None,
            deleted: false,
            form_id: None,
            locale: None,
            savepoint_type: None,
            savepoint_timestamp: None,
            savepoint_creator: None,
            filter_scope: FilterScope::default(),
            values,
        }
    }
}

/// A row as returned by the server, with the table version it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowResource {
    /// The row.
    #[serde(flatten)]
    pub row: Row,
    /// Location of this row.
    #[serde(default)]
    pub self_uri: Option<String>,
    /// Table data ETag right after this row was written.
    #[serde(rename = "dataETagAtModification", default)]
    pub data_etag_at_modification: Option<String>,
}

/// A batch of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowResourceList {
    /// The rows.
    #[serde(default)]
    pub rows: Vec<RowResource>,
}

/// One metadata entry of a table's properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValueStoreEntry {
    /// Owning table.
    pub table_id: String,
    /// Partition scope.
    pub partition: String,
    /// Aspect scope.
    pub aspect: String,
    /// Key within the scope.
    pub key: String,
    /// Type name of the value.
    #[serde(rename = "type")]
    pub value_type: String,
    /// Encoded value.
    #[serde(default)]
    pub value: Option<String>,
}

/// The full property set of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableProperties {
    /// Table identifier.
    pub table_id: String,
    /// Schema ETag the properties belong to.
    #[serde(rename = "schemaETag", default)]
    pub schema_etag: Option<String>,
    /// Version of this property set.
    #[serde(rename = "propertiesETag", default)]
    pub properties_etag: Option<String>,
    /// All entries of the table.
    #[serde(default)]
    pub kvs_entries: Vec<KeyValueStoreEntry>,
}

/// Table properties as served by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertiesResource {
    /// The properties.
    #[serde(flatten)]
    pub properties: TableProperties,
    /// Location of this resource.
    #[serde(default)]
    pub self_uri: Option<String>,
    /// Location of the owning table resource.
    #[serde(default)]
    pub table_uri: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_resource_reads_server_json() {
        let json = r#"{
            "rowId": "r1",
            "rowETag": "e1",
            "deleted": false,
            "savepointType": "COMPLETE",
            "filterScope": {"type": "DEFAULT", "value": null},
            "values": {"age": "7", "name": null},
            "selfUri": "http://host/rows/r1",
            "dataETagAtModification": "d9"
        }"#;
        let resource: RowResource = serde_json::from_str(json).unwrap();
        assert_eq!(resource.row.row_id, "r1");
        assert_eq!(resource.row.row_etag.as_deref(), Some("e1"));
        assert_eq!(resource.row.values["age"].as_deref(), Some("7"));
        assert_eq!(resource.row.values["name"], None);
        assert_eq!(resource.row.filter_scope.filter_type.as_deref(), Some("DEFAULT"));
        assert_eq!(resource.data_etag_at_modification.as_deref(), Some("d9"));
    }

    #[test]
    fn table_resource_tag_order() {
        let resource = TableResource {
            table_id: "t".into(),
            display_name: None,
            schema_etag: Some("s".into()),
            properties_etag: Some("p".into()),
            data_etag: None,
            self_uri: String::new(),
            definition_uri: String::new(),
            data_uri: String::new(),
            diff_uri: String::new(),
            properties_uri: String::new(),
        };
        let tag = resource.sync_tag();
        assert_eq!(tag.schema_etag.as_deref(), Some("s"));
        assert_eq!(tag.properties_etag.as_deref(), Some("p"));
        assert_eq!(tag.data_etag, None);
    }

    #[test]
    fn definition_body_field_names() {
        let definition = TableDefinition {
            table_id: "people".into(),
            schema_etag: None,
            columns: vec![Column::new("age", "integer")],
        };
        let json = serde_json::to_value(&definition).unwrap();
        assert_eq!(json["tableId"], "people");
        assert!(json["schemaETag"].is_null());
        assert_eq!(json["columns"][0]["elementKey"], "age");
        assert_eq!(json["columns"][0]["elementName"], "age");
    }
}
