//! Diff of a schema mapping against live engine metadata.

use super::mapping::{ColumnMapping, SchemaMapping, TableMapping};
use crate::engine::{DatabaseProduct, LiveSchema};

/// DDL that brings `live` up to `mapping`.
///
/// Missing tables are created; missing columns of existing tables are added
/// as nullable. Nothing is ever dropped or altered in place.
pub fn generate_update_script(
    mapping: &SchemaMapping,
    live: &LiveSchema,
    product: DatabaseProduct,
) -> Vec<String> {
    let mut script = Vec::new();
    for table in &mapping.tables {
        if !live.has_table(&table.name) {
            script.push(create_table(table, product));
            continue;
        }
        for column in &table.columns {
            if !live.has_column(&table.name, &column.name) {
                script.push(add_column(table, column, product));
            }
        }
    }
    script
}

fn create_table(table: &TableMapping, product: DatabaseProduct) -> String {
    let mut definitions: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut definition =
                format!("{} {}", column.name, column.column_type.sql_type(product));
            if !column.nullable {
                definition.push_str(" not null");
            }
            definition
        })
        .collect();
    let keys: Vec<&str> = table
        .primary_key_columns()
        .map(|column| column.name.as_str())
        .collect();
    if !keys.is_empty() {
        definitions.push(format!("primary key ({})", keys.join(", ")));
    }
    format!(
        "create table {} ({})",
        table.qualified_name(),
        definitions.join(", ")
    )
}

fn add_column(table: &TableMapping, column: &ColumnMapping, product: DatabaseProduct) -> String {
    let keyword = if product == DatabaseProduct::Oracle {
        "add"
    } else {
        "add column"
    };
    format!(
        "alter table {} {} {} {}",
        table.qualified_name(),
        keyword,
        column.name,
        column.column_type.sql_type(product)
    )
}
