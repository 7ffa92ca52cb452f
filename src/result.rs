//! Query results.
//!
//! A [`ResultAccumulator`] collects the RowDescription, DataRows and
//! CommandComplete of one statement into a [`QueryResult`].

use crate::error::{Error, Result};
use crate::protocol::backend::{DataRow, FieldDescription};
use crate::protocol::types::Oid;
use crate::types::{TypeRegistry, Value};

/// One result row: `(column name, value)` pairs in column order.
///
/// When two columns share a name, the later value replaces the earlier one
/// and the entry keeps the position of the first occurrence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Value of the column named `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Value at `index` in column order.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.columns.get(index).map(|(_, v)| v)
    }

    /// Number of distinct columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    fn insert(&mut self, name: &str, value: Value) {
        match self.columns.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((name.to_string(), value)),
        }
    }
}

/// Parsed CommandComplete tag.
///
/// `"INSERT 0 1"` is verb `INSERT`, oid 0, one row; `"DELETE 3"` is verb
/// `DELETE`, three rows, no oid. A tag that does not start with a letter
/// leaves everything unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag {
    pub command: Option<String>,
    pub row_count: Option<u64>,
    pub oid: Option<Oid>,
}

impl CommandTag {
    pub fn parse(tag: &str) -> Self {
        let verb_len = tag
            .bytes()
            .position(|b| !b.is_ascii_alphabetic())
            .unwrap_or(tag.len());
        if verb_len == 0 {
            return Self::default();
        }
        let (verb, mut rest) = tag.split_at(verb_len);

        let mut numbers = [None; 2];
        for slot in &mut numbers {
            let Some(after_space) = rest.strip_prefix(' ') else {
                break;
            };
            let digits = after_space
                .bytes()
                .position(|b| !b.is_ascii_digit())
                .unwrap_or(after_space.len());
            let Some(n) = after_space
                .get(..digits)
                .and_then(|d| d.parse::<u64>().ok())
            else {
                break;
            };
            *slot = Some(n);
            rest = &after_space[digits..];
        }

        let (oid, row_count) = match numbers {
            [Some(oid), Some(rows)] => (Oid::try_from(oid).ok(), Some(rows)),
            [Some(rows), None] => (None, Some(rows)),
            _ => (None, None),
        };

        Self {
            command: Some(verb.to_string()),
            row_count,
            oid,
        }
    }
}

/// Result of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    command: Option<String>,
    row_count: Option<u64>,
    oid: Option<Oid>,
    fields: Vec<FieldDescription>,
    rows: Vec<Row>,
}

impl QueryResult {
    /// Command verb (`SELECT`, `INSERT`, ...).
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Rows affected or returned, as reported by the server.
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    /// Oid reported by INSERT.
    pub fn oid(&self) -> Option<Oid> {
        self.oid
    }

    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Builds the [`QueryResult`] of one statement.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    fields: Vec<FieldDescription>,
    rows: Vec<Row>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the column descriptions of the statement.
    pub fn row_description(&mut self, fields: Vec<FieldDescription>) {
        self.fields = fields;
    }

    /// Decode and store one row.
    pub fn data_row(&mut self, row: DataRow, registry: &TypeRegistry) -> Result<()> {
        if row.len() != self.fields.len() {
            return Err(Error::Protocol(format!(
                "DataRow has {} values but {} fields were described",
                row.len(),
                self.fields.len()
            )));
        }

        let mut out = Row {
            columns: Vec::with_capacity(self.fields.len()),
        };
        for (field, value) in self.fields.iter().zip(row.values) {
            let value = registry.decode(field, value.as_ref())?;
            out.insert(&field.name, value);
        }
        self.rows.push(out);
        Ok(())
    }

    /// Finish the statement with its CommandComplete tag.
    pub fn command_complete(self, tag: &str) -> QueryResult {
        let CommandTag {
            command,
            row_count,
            oid,
        } = CommandTag::parse(tag);
        QueryResult {
            command,
            row_count,
            oid,
            fields: self.fields,
            rows: self.rows,
        }
    }
}
