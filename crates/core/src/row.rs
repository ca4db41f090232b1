//! Row model shared by the row-store adapter and the schema mapping
//!
//! A [`Row`] is an ordered list of [`Column`] values laid out according to a
//! [`TableDef`]. The row store treats rows as opaque apart from the key
//! columns it indexes on.

use crate::error::{Error, Result};
use std::fmt;

/// Fully qualified table name (`database.table`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    /// Database (schema) name
    pub database: String,
    /// Table name within the database
    pub table: String,
}

impl TableName {
    /// Create a table name
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Index a cursor is opened on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexSpec {
    /// Clustered (primary key) index
    Primary,
    /// Named unique secondary index
    Secondary(String),
}

impl IndexSpec {
    /// Parse a configured index name; `PRIMARY` (any case) or empty is the
    /// clustered index
    pub fn from_name(name: &str) -> Self {
        if name.is_empty() || name.eq_ignore_ascii_case("primary") {
            IndexSpec::Primary
        } else {
            IndexSpec::Secondary(name.to_string())
        }
    }

    /// True for a secondary index
    pub fn is_secondary(&self) -> bool {
        matches!(self, IndexSpec::Secondary(_))
    }
}

/// Single column value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Column {
    /// SQL NULL
    #[default]
    Null,
    /// Character/binary data
    Bytes(Vec<u8>),
    /// Unsigned integer
    UInt(u64),
}

impl Column {
    /// Byte content; integers are rendered as decimal text
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Column::Null => Vec::new(),
            Column::Bytes(b) => b.clone(),
            Column::UInt(n) => n.to_string().into_bytes(),
        }
    }

    /// Integer content; byte columns are parsed as decimal text
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            Column::Null => None,
            Column::UInt(n) => Some(*n),
            Column::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
        }
    }

    /// True for NULL or empty byte content
    pub fn is_empty(&self) -> bool {
        match self {
            Column::Null => true,
            Column::Bytes(b) => b.is_empty(),
            Column::UInt(_) => false,
        }
    }
}

/// One table row
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    columns: Vec<Column>,
}

impl Row {
    /// Create a row from its columns
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Row with `width` NULL columns
    pub fn with_width(width: usize) -> Self {
        Self {
            columns: vec![Column::Null; width],
        }
    }

    /// Column at `idx`
    pub fn column(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    /// Overwrite column `idx`, growing the row if needed
    pub fn set(&mut self, idx: usize, value: Column) {
        if idx >= self.columns.len() {
            self.columns.resize(idx + 1, Column::Null);
        }
        self.columns[idx] = value;
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// All columns
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// VARCHAR/BLOB-like
    Bytes,
    /// BIGINT UNSIGNED-like
    UInt,
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Storage type
    pub kind: ColumnKind,
}

impl ColumnDef {
    /// Byte column
    pub fn bytes(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Bytes,
        }
    }

    /// Unsigned integer column
    pub fn uint(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::UInt,
        }
    }
}

/// Unique secondary index on one column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryIndexDef {
    /// Index name
    pub name: String,
    /// Indexed column position
    pub column: usize,
}

/// Table definition as reported by the row store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Qualified name
    pub name: TableName,
    /// Column layout
    pub columns: Vec<ColumnDef>,
    /// Position of the clustered key column
    pub primary_key: usize,
    /// Secondary indexes
    pub secondary_indexes: Vec<SecondaryIndexDef>,
}

impl TableDef {
    /// Create a table definition keyed on `primary_key`
    pub fn new(name: TableName, columns: Vec<ColumnDef>, primary_key: usize) -> Self {
        Self {
            name,
            columns,
            primary_key,
            secondary_indexes: Vec::new(),
        }
    }

    /// Add a unique secondary index on column `column`
    pub fn with_secondary_index(mut self, name: impl Into<String>, column: usize) -> Self {
        self.secondary_indexes.push(SecondaryIndexDef {
            name: name.into(),
            column,
        });
        self
    }

    /// Position of the column named `name` (case-insensitive)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Column a cursor on `index` searches by
    pub fn search_column(&self, index: &IndexSpec) -> Result<usize> {
        match index {
            IndexSpec::Primary => Ok(self.primary_key),
            IndexSpec::Secondary(name) => self
                .secondary_indexes
                .iter()
                .find(|idx| idx.name.eq_ignore_ascii_case(name))
                .map(|idx| idx.column)
                .ok_or_else(|| {
                    Error::config(format!("index '{}' not found on {}", name, self.name))
                }),
        }
    }

    /// Search key of `row` under `index`
    pub fn key_of(&self, row: &Row, index: &IndexSpec) -> Result<Vec<u8>> {
        let col = self.search_column(index)?;
        row.column(col)
            .map(Column::to_bytes)
            .ok_or_else(|| Error::InvalidOperation(format!("row has no column {}", col)))
    }
}
