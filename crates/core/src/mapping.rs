//! Schema mapping between a row-store table and cache items
//!
//! A [`TableMapping`] names the columns that hold the cache fields. It is
//! resolved once against the table definition the row store reports,
//! yielding a [`ResolvedMapping`] that converts rows to items and back.
//!
//! Multiple value columns are supported: on read, the non-empty value
//! columns are joined with the configured separator; on write, the value is
//! split on the separator into at most as many parts as there are value
//! columns.

use crate::error::{Error, Result};
use crate::item::CacheItem;
use crate::row::{Column, ColumnKind, IndexSpec, Row, TableDef, TableName};
use serde::{Deserialize, Serialize};

fn default_index() -> String {
    "PRIMARY".to_string()
}

fn default_separator() -> String {
    "|".to_string()
}

/// Configured column-to-field mapping for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    /// Database holding the table
    pub database: String,
    /// Table name
    pub table: String,
    /// Column holding the cache key
    pub key_column: String,
    /// Columns holding the value, in concatenation order
    pub value_columns: Vec<String>,
    /// Column holding client flags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags_column: Option<String>,
    /// Column holding the CAS token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas_column: Option<String>,
    /// Column holding the absolute expiration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_column: Option<String>,
    /// Index used for key lookups (`PRIMARY` or a secondary index name)
    #[serde(default = "default_index")]
    pub index: String,
    /// Separator for multi-column values
    #[serde(default = "default_separator")]
    pub separator: String,
}

impl TableMapping {
    /// Qualified table name
    pub fn table_name(&self) -> TableName {
        TableName::new(&self.database, &self.table)
    }

    /// Resolve column names against the table definition
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a column or the index does not exist, if
    /// the key column is not what the chosen index searches by, or if no
    /// value column is configured.
    pub fn resolve(&self, def: &TableDef) -> Result<ResolvedMapping> {
        let find = |name: &str| {
            def.column_index(name).ok_or_else(|| {
                Error::config(format!("column '{}' not found in {}", name, def.name))
            })
        };
        let find_opt = |name: &Option<String>| name.as_deref().map(find).transpose();

        if self.value_columns.is_empty() {
            return Err(Error::config(format!(
                "mapping for {} has no value columns",
                def.name
            )));
        }

        let index = IndexSpec::from_name(&self.index);
        let key = find(&self.key_column)?;
        if def.search_column(&index)? != key {
            return Err(Error::config(format!(
                "index '{}' on {} does not cover key column '{}'",
                self.index, def.name, self.key_column
            )));
        }

        let values = self
            .value_columns
            .iter()
            .map(|c| find(c.as_str()))
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedMapping {
            table: def.name.clone(),
            index,
            width: def.columns.len(),
            kinds: def.columns.iter().map(|c| c.kind).collect(),
            key,
            values,
            flags: find_opt(&self.flags_column)?,
            cas: find_opt(&self.cas_column)?,
            expire: find_opt(&self.expire_column)?,
            separator: self.separator.as_bytes().to_vec(),
        })
    }
}

/// Mapping with column names resolved to positions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMapping {
    table: TableName,
    index: IndexSpec,
    width: usize,
    kinds: Vec<ColumnKind>,
    key: usize,
    values: Vec<usize>,
    flags: Option<usize>,
    cas: Option<usize>,
    expire: Option<usize>,
    separator: Vec<u8>,
}

impl ResolvedMapping {
    /// Table the mapping applies to
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Index used for key lookups
    pub fn index(&self) -> &IndexSpec {
        &self.index
    }

    /// True if lookups go through a secondary index
    pub fn uses_secondary_index(&self) -> bool {
        self.index.is_secondary()
    }

    /// True if CAS tokens are persisted in a column
    pub fn stores_cas(&self) -> bool {
        self.cas.is_some()
    }

    /// Decode a row into a cache item
    ///
    /// Flags wider than 32 bits saturate at `u32::MAX`.
    pub fn row_to_item(&self, row: &Row) -> CacheItem {
        let get = |idx: usize| row.column(idx).cloned().unwrap_or_default();
        let num = |idx: Option<usize>| idx.and_then(|i| get(i).to_u64()).unwrap_or(0);

        CacheItem {
            key: get(self.key).to_bytes(),
            value: self.join_value(row),
            flags: u32::try_from(num(self.flags)).unwrap_or(u32::MAX),
            cas: num(self.cas),
            expiration: num(self.expire),
        }
    }

    /// Encode a cache item as a full row
    pub fn item_to_row(&self, item: &CacheItem) -> Row {
        let mut row = Row::with_width(self.width);
        row.set(self.key, self.column(self.key, item.key.clone()));

        let parts = self.split_value(&item.value);
        for (pos, &col) in self.values.iter().enumerate() {
            let part = parts.get(pos).cloned().unwrap_or_default();
            row.set(col, self.column(col, part));
        }
        if let Some(col) = self.flags {
            row.set(col, Column::UInt(u64::from(item.flags)));
        }
        if let Some(col) = self.cas {
            row.set(col, Column::UInt(item.cas));
        }
        if let Some(col) = self.expire {
            row.set(col, Column::UInt(item.expiration));
        }
        row
    }

    fn column(&self, idx: usize, bytes: Vec<u8>) -> Column {
        match self.kinds.get(idx) {
            Some(ColumnKind::UInt) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Column::UInt)
                .unwrap_or(Column::Bytes(bytes)),
            _ => Column::Bytes(bytes),
        }
    }

    /// Join the non-empty value columns of `row`
    pub fn join_value(&self, row: &Row) -> Vec<u8> {
        let mut out = Vec::new();
        let mut first = true;
        for &col in &self.values {
            let Some(column) = row.column(col) else {
                continue;
            };
            if column.is_empty() {
                continue;
            }
            if !first {
                out.extend_from_slice(&self.separator);
            }
            out.extend_from_slice(&column.to_bytes());
            first = false;
        }
        out
    }

    /// Split `value` into at most one part per value column
    pub fn split_value(&self, value: &[u8]) -> Vec<Vec<u8>> {
        let n = self.values.len();
        if n == 1 || self.separator.is_empty() {
            return vec![value.to_vec()];
        }

        let mut parts = Vec::with_capacity(n);
        let mut rest = value;
        while parts.len() + 1 < n {
            match find_subslice(rest, &self.separator) {
                Some(pos) => {
                    parts.push(rest[..pos].to_vec());
                    rest = &rest[pos + self.separator.len()..];
                }
                None => break,
            }
        }
        parts.push(rest.to_vec());
        parts
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
