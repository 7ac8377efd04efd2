use crate::db::ColumnInfo;
use crate::probe::{quote_ident, quote_table};

/// Synthesize the SQL expression for one column of a minimal INSERT row.
///
/// Deterministic over column name and declared type, with one exception:
/// free-standing uuid columns get a fresh literal so repeated probes of the
/// same table do not collide with each other.
pub fn insert_value(column: &ColumnInfo) -> String {
    let data_type = column.data_type.to_ascii_lowercase();
    let name = column.name.to_ascii_lowercase();

    if data_type == "uuid" {
        // id/user_id columns tie rows to the caller in the common RLS
        // pattern, so the probe must claim ownership of the row it writes.
        if name == "id" || name == "user_id" {
            return "auth.uid()".to_string();
        }
        return format!("'{}'", uuid::Uuid::new_v4());
    }

    match data_type.as_str() {
        "text" | "character varying" | "character" | "varchar" | "citext" => "'test'".to_string(),
        "smallint" | "integer" | "bigint" | "numeric" | "decimal" | "real"
        | "double precision" => "1".to_string(),
        "boolean" => "true".to_string(),
        _ => "DEFAULT".to_string(),
    }
}

/// Build the INSERT statement for a minimal probe row.
///
/// Columns with a default are dropped; when every column has one, the
/// statement degenerates to `DEFAULT VALUES`. `overrides` pins specific
/// columns to caller-supplied SQL expressions (the storage probe pins
/// `bucket_id` this way).
pub fn build_insert_sql(
    schema: &str,
    table: &str,
    columns: &[ColumnInfo],
    overrides: &[(&str, String)],
) -> String {
    let target = quote_table(schema, table);
    let required: Vec<&ColumnInfo> = columns.iter().filter(|c| !c.has_default).collect();
    if required.is_empty() {
        return format!("INSERT INTO {target} DEFAULT VALUES");
    }

    let mut names = Vec::with_capacity(required.len());
    let mut values = Vec::with_capacity(required.len());
    for column in required {
        names.push(quote_ident(&column.name));
        let overridden = overrides
            .iter()
            .find(|(name, _)| *name == column.name)
            .map(|(_, value)| value.clone());
        values.push(overridden.unwrap_or_else(|| insert_value(column)));
    }

    format!(
        "INSERT INTO {target} ({}) VALUES ({})",
        names.join(", "),
        values.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str, has_default: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            has_default,
            is_nullable: false,
        }
    }

    #[test]
    fn owner_uuid_columns_claim_the_caller() {
        assert_eq!(insert_value(&column("id", "uuid", false)), "auth.uid()");
        assert_eq!(insert_value(&column("user_id", "uuid", false)), "auth.uid()");
    }

    #[test]
    fn other_uuid_columns_get_a_literal() {
        let value = insert_value(&column("team_id", "uuid", false));
        assert!(value.starts_with('\'') && value.ends_with('\''));
        assert_eq!(value.len(), 38);
    }

    #[test]
    fn scalar_types_get_fixed_values() {
        assert_eq!(insert_value(&column("title", "text", false)), "'test'");
        assert_eq!(
            insert_value(&column("label", "character varying", false)),
            "'test'"
        );
        assert_eq!(insert_value(&column("count", "integer", false)), "1");
        assert_eq!(insert_value(&column("price", "numeric", false)), "1");
        assert_eq!(insert_value(&column("done", "boolean", false)), "true");
        assert_eq!(
            insert_value(&column("created_at", "timestamp with time zone", false)),
            "DEFAULT"
        );
    }

    #[test]
    fn defaulted_columns_are_dropped_from_the_insert() {
        let columns = vec![
            column("id", "uuid", true),
            column("title", "text", false),
            column("done", "boolean", false),
        ];
        let sql = build_insert_sql("public", "todos", &columns, &[]);
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"todos\" (\"title\", \"done\") VALUES ('test', true)"
        );
    }

    #[test]
    fn all_defaults_degenerate_to_default_values() {
        let columns = vec![column("id", "uuid", true), column("created_at", "timestamptz", true)];
        let sql = build_insert_sql("public", "todos", &columns, &[]);
        assert_eq!(sql, "INSERT INTO \"public\".\"todos\" DEFAULT VALUES");
    }

    #[test]
    fn overrides_pin_specific_columns() {
        let columns = vec![
            column("bucket_id", "text", false),
            column("name", "text", false),
        ];
        let sql = build_insert_sql(
            "storage",
            "objects",
            &columns,
            &[("bucket_id", "'avatars'".to_string())],
        );
        assert_eq!(
            sql,
            "INSERT INTO \"storage\".\"objects\" (\"bucket_id\", \"name\") VALUES ('avatars', 'test')"
        );
    }
}
