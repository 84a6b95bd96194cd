//! Key-value metadata store.
//!
//! Entries are scoped by (table, partition, aspect, key). At most one entry
//! exists per scope; every write deletes the scope before inserting.

use crate::catalog::set_properties_dirty;
use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection};
use tablesync_protocol::{KeyValueStoreEntry, KvType, KvValue};
use tracing::warn;

/// Address of one metadata entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KvKey {
    /// Owning table.
    pub table_id: String,
    /// Partition scope.
    pub partition: String,
    /// Aspect scope.
    pub aspect: String,
    /// Key within the scope.
    pub key: String,
}

impl KvKey {
    /// Creates a key.
    pub fn new(
        table_id: impl Into<String>,
        partition: impl Into<String>,
        aspect: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            partition: partition.into(),
            aspect: aspect.into(),
            key: key.into(),
        }
    }
}

/// A stored metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueEntry {
    /// Address of the entry.
    pub key: KvKey,
    /// Declared type.
    pub value_type: KvType,
    /// Encoded value; never null.
    pub value: String,
}

impl KeyValueEntry {
    /// Decodes the value according to its declared type.
    pub fn decoded(&self) -> StoreResult<KvValue> {
        Ok(KvValue::decode(self.value_type, &self.value)?)
    }

    /// Converts to the wire form.
    pub fn to_wire(&self) -> KeyValueStoreEntry {
        KeyValueStoreEntry {
            table_id: self.key.table_id.clone(),
            partition: self.key.partition.clone(),
            aspect: self.key.aspect.clone(),
            key: self.key.key.clone(),
            value_type: self.value_type.as_str().to_string(),
            value: Some(self.value.clone()),
        }
    }

    /// Converts from the wire form. A null value becomes the empty string.
    pub fn from_wire(entry: &KeyValueStoreEntry) -> StoreResult<Self> {
        Ok(Self {
            key: KvKey::new(
                entry.table_id.clone(),
                entry.partition.clone(),
                entry.aspect.clone(),
                entry.key.clone(),
            ),
            value_type: entry.value_type.parse()?,
            value: entry.value.clone().unwrap_or_default(),
        })
    }
}

fn delete_scope(conn: &Connection, key: &KvKey) -> StoreResult<usize> {
    Ok(conn.execute(
        "DELETE FROM _key_value_store
         WHERE table_id = ?1 AND partition = ?2 AND aspect = ?3 AND key = ?4",
        params![key.table_id, key.partition, key.aspect, key.key],
    )?)
}

fn insert_entry(conn: &Connection, entry: &KeyValueEntry) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO _key_value_store (table_id, partition, aspect, key, value_type, value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.key.table_id,
            entry.key.partition,
            entry.key.aspect,
            entry.key.key,
            entry.value_type.as_str(),
            entry.value
        ],
    )?;
    Ok(())
}

fn select_entries(
    conn: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
) -> StoreResult<Vec<KeyValueEntry>> {
    let sql = format!(
        "SELECT table_id, partition, aspect, key, value_type, value
         FROM _key_value_store {where_clause}
         ORDER BY partition, aspect, key, rowid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(args, |row| {
            Ok((
                KvKey {
                    table_id: row.get(0)?,
                    partition: row.get(1)?,
                    aspect: row.get(2)?,
                    key: row.get(3)?,
                },
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(key, value_type, value)| {
            Ok(KeyValueEntry {
                key,
                value_type: value_type.parse()?,
                value,
            })
        })
        .collect()
}

/// All entries of a table.
pub fn table_entries(conn: &Connection, table_id: &str) -> StoreResult<Vec<KeyValueEntry>> {
    select_entries(conn, "WHERE table_id = ?1", &[&table_id])
}

/// Replaces every entry of a table with `entries`.
///
/// Used when the server's properties are pulled, so it clears the table's
/// unpushed-properties flag.
pub fn replace_table_entries(
    conn: &Connection,
    table_id: &str,
    entries: &[KeyValueEntry],
) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM _key_value_store WHERE table_id = ?1",
        params![table_id],
    )?;
    for entry in entries {
        delete_scope(conn, &entry.key)?;
        insert_entry(conn, entry)?;
    }
    set_properties_dirty(conn, table_id, false)
}

/// Typed access to the metadata store.
pub struct KeyValueStore<'a> {
    db: &'a Database,
}

impl<'a> KeyValueStore<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Writes an entry, replacing any entry with the same address.
    ///
    /// A `None` value is stored as the empty string. Marks the table's
    /// properties as needing a push.
    pub fn insert_or_update_key(
        &self,
        key: &KvKey,
        value_type: KvType,
        value: Option<&str>,
    ) -> StoreResult<()> {
        let entry = KeyValueEntry {
            key: key.clone(),
            value_type,
            value: value.unwrap_or_default().to_string(),
        };
        self.db.transaction(|tx| {
            delete_scope(tx, key)?;
            insert_entry(tx, &entry)?;
            set_properties_dirty(tx, &key.table_id, true)
        })
    }

    /// Writes a typed value.
    pub fn set_value(&self, key: &KvKey, value: &KvValue) -> StoreResult<()> {
        self.insert_or_update_key(key, value.kv_type(), Some(&value.encode()))
    }

    /// Removes the entry at an address and returns how many rows went away.
    pub fn delete_key(&self, key: &KvKey) -> StoreResult<usize> {
        let removed = self.db.transaction(|tx| {
            let removed = delete_scope(tx, key)?;
            if removed > 0 {
                set_properties_dirty(tx, &key.table_id, true)?;
            }
            Ok::<_, StoreError>(removed)
        })?;
        if removed > 1 {
            warn!(
                table_id = %key.table_id,
                partition = %key.partition,
                aspect = %key.aspect,
                key = %key.key,
                removed,
                "deleted more than one entry for a single key"
            );
        }
        Ok(removed)
    }

    /// Reads the entry at an address.
    ///
    /// If more than one entry exists, a warning is logged and the first is used.
    pub fn entry(&self, key: &KvKey) -> StoreResult<Option<KeyValueEntry>> {
        let mut found = self.db.read(|conn| {
            select_entries(
                conn,
                "WHERE table_id = ?1 AND partition = ?2 AND aspect = ?3 AND key = ?4",
                &[&key.table_id, &key.partition, &key.aspect, &key.key],
            )
        })?;
        if found.len() > 1 {
            warn!(
                table_id = %key.table_id,
                key = %key.key,
                count = found.len(),
                "multiple entries for a single key; using the first"
            );
        }
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    /// Reads and decodes the value at an address.
    pub fn get_value(&self, key: &KvKey) -> StoreResult<Option<KvValue>> {
        self.entry(key)?.map(|e| e.decoded()).transpose()
    }

    fn typed(&self, key: &KvKey, expected: KvType) -> StoreResult<Option<KvValue>> {
        match self.entry(key)? {
            None => Ok(None),
            Some(entry) if entry.value_type == expected => entry.decoded().map(Some),
            Some(entry) => Err(StoreError::TypeMismatch {
                key: key.key.clone(),
                expected,
                actual: entry.value_type,
            }),
        }
    }

    /// Reads an integer value.
    pub fn get_integer(&self, key: &KvKey) -> StoreResult<Option<i64>> {
        Ok(match self.typed(key, KvType::Integer)? {
            Some(KvValue::Integer(v)) => Some(v),
            _ => None,
        })
    }

    /// Reads a number value.
    pub fn get_number(&self, key: &KvKey) -> StoreResult<Option<f64>> {
        Ok(match self.typed(key, KvType::Number)? {
            Some(KvValue::Number(v)) => Some(v),
            _ => None,
        })
    }

    /// Reads a boolean value.
    pub fn get_bool(&self, key: &KvKey) -> StoreResult<Option<bool>> {
        Ok(match self.typed(key, KvType::Bool)? {
            Some(KvValue::Bool(v)) => Some(v),
            _ => None,
        })
    }

    /// Reads a string value.
    pub fn get_string(&self, key: &KvKey) -> StoreResult<Option<String>> {
        Ok(match self.typed(key, KvType::String)? {
            Some(KvValue::String(v)) => Some(v),
            _ => None,
        })
    }

    /// Reads a JSON object value.
    pub fn get_object(&self, key: &KvKey) -> StoreResult<Option<serde_json::Value>> {
        Ok(match self.typed(key, KvType::Object)? {
            Some(KvValue::Object(v)) => Some(v),
            _ => None,
        })
    }

    /// Reads a JSON array value.
    pub fn get_array(&self, key: &KvKey) -> StoreResult<Option<serde_json::Value>> {
        Ok(match self.typed(key, KvType::Array)? {
            Some(KvValue::Array(v)) => Some(v),
            _ => None,
        })
    }

    /// Entries of a table, optionally narrowed to a partition and aspect.
    pub fn entries_for(
        &self,
        table_id: &str,
        partition: Option<&str>,
        aspect: Option<&str>,
    ) -> StoreResult<Vec<KeyValueEntry>> {
        let entries = self.db.read(|conn| table_entries(conn, table_id))?;
        Ok(entries
            .into_iter()
            .filter(|e| partition.map_or(true, |p| e.key.partition == p))
            .filter(|e| aspect.map_or(true, |a| e.key.aspect == a))
            .collect())
    }

    /// Replaces every entry of a table in one transaction.
    pub fn replace_table_entries(
        &self,
        table_id: &str,
        entries: &[KeyValueEntry],
    ) -> StoreResult<()> {
        self.db
            .transaction(|tx| replace_table_entries(tx, table_id, entries))
    }
}
