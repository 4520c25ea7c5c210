//! Declarative table mappings for the wiki storage schema.
//!
//! # Responsibility
//! - Describe the tables and columns the store expects to exist.
//! - Build per-class dedicated tables for custom-mapped object classes.
//!
//! # Invariants
//! - Every table and column name is a plain SQL identifier.
//! - A table's `schema`, when set, qualifies every statement generated for it.

use crate::engine::DatabaseProduct;
use crate::error::{StoreError, StoreResult};
use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier regex is valid")
});

pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

/// Portable column type, rendered per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    Varchar(u32),
    LongText,
    Timestamp,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(self, product: DatabaseProduct) -> String {
        use DatabaseProduct::*;
        match (self, product) {
            (Self::Integer | Self::BigInt | Self::Boolean | Self::Timestamp, Sqlite) => {
                "integer".to_string()
            }
            (Self::Varchar(_) | Self::LongText, Sqlite) => "text".to_string(),
            (Self::Integer, Oracle) => "number(10,0)".to_string(),
            (Self::BigInt, Oracle) => "number(19,0)".to_string(),
            (Self::Boolean, Oracle) => "number(1,0)".to_string(),
            (Self::Varchar(len), Oracle) => format!("varchar2({len})"),
            (Self::LongText, Oracle) => "clob".to_string(),
            (Self::Integer, _) => "integer".to_string(),
            (Self::BigInt, _) => "bigint".to_string(),
            (Self::Boolean, MySql) => "bit".to_string(),
            (Self::Boolean, _) => "boolean".to_string(),
            (Self::Varchar(len), _) => format!("varchar({len})"),
            (Self::LongText, MySql) => "mediumtext".to_string(),
            (Self::LongText, Derby | Hsqldb) => "clob".to_string(),
            (Self::LongText, _) => "text".to_string(),
            (Self::Timestamp, MySql) => "datetime".to_string(),
            (Self::Timestamp, _) => "timestamp".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnMapping {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub name: String,
    pub schema: Option<String>,
    pub columns: Vec<ColumnMapping>,
}

impl TableMapping {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnMapping) -> Self {
        self.columns.push(column);
        self
    }

    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.columns.iter().filter(|column| column.primary_key)
    }
}

/// The full set of tables a store keeps in sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMapping {
    pub default_schema: Option<String>,
    pub tables: Vec<TableMapping>,
}

impl SchemaMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableMapping) -> Self {
        self.tables.push(table);
        self
    }

    pub fn table_named(&self, name: &str) -> Option<&TableMapping> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    /// Tables of the core document store.
    pub fn core() -> Self {
        use ColumnType::*;
        let text = || Varchar(255);
        Self::new()
            .table(
                TableMapping::new("wikidoc")
                    .column(ColumnMapping::new("id", BigInt).primary_key())
                    .column(ColumnMapping::new("fullname", text()))
                    .column(ColumnMapping::new("name", text()).not_null())
                    .column(ColumnMapping::new("space", text()).not_null())
                    .column(ColumnMapping::new("language", Varchar(5)))
                    .column(ColumnMapping::new("default_language", Varchar(5)))
                    .column(ColumnMapping::new("translation", Integer))
                    .column(ColumnMapping::new("content", LongText))
                    .column(ColumnMapping::new("version", text()))
                    .column(ColumnMapping::new("author", text()))
                    .column(ColumnMapping::new("updated_at", Timestamp))
                    .column(ColumnMapping::new("elements", Integer)),
            )
            .table(
                TableMapping::new("wikiobjects")
                    .column(ColumnMapping::new("id", BigInt).primary_key())
                    .column(ColumnMapping::new("name", text()).not_null())
                    .column(ColumnMapping::new("classname", text()))
                    .column(ColumnMapping::new("number", Integer)),
            )
            .table(
                TableMapping::new("wikiproperties")
                    .column(ColumnMapping::new("id", BigInt).primary_key())
                    .column(ColumnMapping::new("name", text()).primary_key())
                    .column(ColumnMapping::new("classtype", text())),
            )
            .table(
                TableMapping::new("wikilongs")
                    .column(ColumnMapping::new("id", BigInt).primary_key())
                    .column(ColumnMapping::new("name", text()).primary_key())
                    .column(ColumnMapping::new("value", BigInt)),
            )
            .table(
                TableMapping::new("wikiarchive")
                    .column(ColumnMapping::new("fullname", text()).primary_key())
                    .column(ColumnMapping::new("archive", LongText).not_null())
                    .column(ColumnMapping::new("updated_at", Timestamp)),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyColumn {
    pub property: String,
    pub column: String,
    pub column_type: ColumnType,
}

/// Storage mapping of one object class.
///
/// Classes with a dedicated table store one row per object, keyed by the
/// object id, with one column per mapped property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMapping {
    class_name: String,
    dedicated_table: bool,
    properties: Vec<PropertyColumn>,
}

impl ClassMapping {
    pub fn builder(class_name: impl Into<String>) -> ClassMappingBuilder {
        ClassMappingBuilder {
            class_name: class_name.into(),
            dedicated_table: true,
            properties: Vec::new(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn has_dedicated_table(&self) -> bool {
        self.dedicated_table && !self.properties.is_empty()
    }

    pub fn properties(&self) -> &[PropertyColumn] {
        &self.properties
    }

    pub fn table_name(&self) -> String {
        let sanitized: String = self
            .class_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("wikicustom_{}", sanitized.to_ascii_lowercase())
    }

    pub fn to_schema_mapping(&self) -> SchemaMapping {
        if !self.has_dedicated_table() {
            return SchemaMapping::new();
        }
        let table = self.properties.iter().fold(
            TableMapping::new(self.table_name())
                .column(ColumnMapping::new("wo_id", ColumnType::BigInt).primary_key()),
            |table, property| {
                table.column(ColumnMapping::new(&property.column, property.column_type))
            },
        );
        SchemaMapping::new().table(table)
    }
}

pub struct ClassMappingBuilder {
    class_name: String,
    dedicated_table: bool,
    properties: Vec<PropertyColumn>,
}

impl ClassMappingBuilder {
    pub fn dedicated_table(mut self, dedicated: bool) -> Self {
        self.dedicated_table = dedicated;
        self
    }

    pub fn property(
        mut self,
        property: impl Into<String>,
        column: impl Into<String>,
        column_type: ColumnType,
    ) -> Self {
        self.properties.push(PropertyColumn {
            property: property.into(),
            column: column.into(),
            column_type,
        });
        self
    }

    /// # Errors
    /// - `Config` when the class name is empty or a column name is not a
    ///   plain identifier, or two properties share a column.
    pub fn build(self) -> StoreResult<ClassMapping> {
        if self.class_name.trim().is_empty() {
            return Err(StoreError::Config("class name cannot be empty".to_string()));
        }
        for (index, property) in self.properties.iter().enumerate() {
            if !is_valid_identifier(&property.column) || property.column.eq_ignore_ascii_case("wo_id")
            {
                return Err(StoreError::Config(format!(
                    "invalid column `{}` for property `{}` of class {}",
                    property.column, property.property, self.class_name
                )));
            }
            let duplicate = self.properties[..index]
                .iter()
                .any(|other| other.column.eq_ignore_ascii_case(&property.column));
            if duplicate {
                return Err(StoreError::Config(format!(
                    "column `{}` mapped twice in class {}",
                    property.column, self.class_name
                )));
            }
        }
        Ok(ClassMapping {
            class_name: self.class_name,
            dedicated_table: self.dedicated_table,
            properties: self.properties,
        })
    }
}
