//! Init-table command implementation.

use std::path::Path;
use tablesync_protocol::Column;
use tablesync_store::Database;

/// Parses `key` or `key:type`; the type defaults to `string`.
pub fn parse_column(spec: &str) -> Result<Column, String> {
    let (key, element_type) = match spec.split_once(':') {
        Some((key, element_type)) => (key.trim(), element_type.trim()),
        None => (spec.trim(), "string"),
    };
    if key.is_empty() {
        return Err(format!("missing column name in {spec:?}"));
    }
    if element_type.is_empty() {
        return Err(format!("missing column type in {spec:?}"));
    }
    Ok(Column::new(key, element_type))
}

/// Runs the init-table command.
pub fn run(
    path: &Path,
    table_id: &str,
    columns: &[String],
    display_name: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let columns = columns
        .iter()
        .map(|c| parse_column(c))
        .collect::<Result<Vec<_>, _>>()?;

    let db = Database::open(path)?;
    let table = db.create_table(table_id, display_name, &columns)?;

    println!("Created table {}", table.table_id);
    for column in &table.columns {
        println!("  {:<24} {}", column.element_key, column.element_type);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_a_string_column() {
        let column = parse_column("name").unwrap();
        assert_eq!(column.element_key, "name");
        assert_eq!(column.element_type, "string");
    }

    #[test]
    fn explicit_type_is_kept() {
        let column = parse_column("age : integer").unwrap();
        assert_eq!(column.element_key, "age");
        assert_eq!(column.element_type, "integer");
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert!(parse_column(":integer").is_err());
        assert!(parse_column("age:").is_err());
    }

    #[test]
    fn run_registers_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let columns = vec!["name".to_string(), "age:integer".to_string()];
        run(&path, "people", &columns, Some("People")).unwrap();

        let db = Database::open(&path).unwrap();
        let table = db.table("people").unwrap();
        assert_eq!(table.display_name.as_deref(), Some("People"));
        assert_eq!(table.column_keys(), ["name", "age"]);
        assert!(table.sync_tag.data_etag.is_none());
    }
}
