// Schema Changes
//
// DDL intents arrive already parsed and semantically checked. Before a job
// is accepted the intent is replayed against the current catalog schema, so
// a conflict introduced since analysis is caught at submit rather than
// halfway through a physical mutation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogError, Column, TableSchema};
use crate::ids::{JobId, TableId};
use crate::log::LogError;
use crate::state::{JobState, StateError};
use crate::txn::TxnError;

pub mod coordinator;
pub mod job;

pub use coordinator::SchemaChangeCoordinator;
pub use job::SchemaJob;

/// Where a new or modified column goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnPosition {
    First,
    After(String),
}

impl fmt::Display for ColumnPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => f.write_str("FIRST"),
            Self::After(column) => write!(f, "AFTER `{column}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ColumnMutation {
    AddColumn {
        column: Column,
        #[serde(default)]
        position: Option<ColumnPosition>,
    },
    DropColumn {
        name: String,
    },
    ModifyColumn {
        column: Column,
        #[serde(default)]
        position: Option<ColumnPosition>,
    },
}

impl ColumnMutation {
    pub fn add(column: Column) -> Self {
        Self::AddColumn {
            column,
            position: None,
        }
    }

    pub fn add_at(column: Column, position: ColumnPosition) -> Self {
        Self::AddColumn {
            column,
            position: Some(position),
        }
    }

    pub fn drop(name: &str) -> Self {
        Self::DropColumn { name: name.into() }
    }

    pub fn modify(column: Column) -> Self {
        Self::ModifyColumn {
            column,
            position: None,
        }
    }

    /// ALTER clause for this mutation, e.g.
    /// ``ADD COLUMN `c` INT NULL AFTER `k` IN `r1` ``.
    pub fn to_sql(&self, rollup: Option<&str>) -> String {
        let (verb, body, position) = match self {
            Self::AddColumn { column, position } => ("ADD COLUMN", column.to_sql(), position),
            Self::ModifyColumn { column, position } => {
                ("MODIFY COLUMN", column.to_sql(), position)
            }
            Self::DropColumn { name } => ("DROP COLUMN", format!("`{name}`"), &None),
        };
        let mut sql = format!("{verb} {body}");
        if let Some(position) = position {
            sql.push_str(&format!(" {position}"));
        }
        match (self, rollup) {
            (Self::DropColumn { .. }, Some(rollup)) => sql.push_str(&format!(" FROM `{rollup}`")),
            (_, Some(rollup)) => sql.push_str(&format!(" IN `{rollup}`")),
            (_, None) => {}
        }
        sql
    }
}

/// A validated, immutable DDL intent from the analysis layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChangeIntent {
    pub table: TableId,
    pub mutations: Vec<ColumnMutation>,
    /// Target rollup index. `None` targets the base index.
    #[serde(default)]
    pub rollup: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl SchemaChangeIntent {
    pub fn new(table: TableId, mutations: Vec<ColumnMutation>) -> Self {
        Self {
            table,
            mutations,
            rollup: None,
            properties: BTreeMap::new(),
        }
    }

    /// An empty name means the base index.
    pub fn with_rollup(mut self, rollup: &str) -> Self {
        self.rollup = (!rollup.is_empty()).then(|| rollup.to_string());
        self
    }

    pub fn rollup(&self) -> Option<&str> {
        self.rollup.as_deref().filter(|r| !r.is_empty())
    }

    pub fn to_sql(&self) -> String {
        self.mutations
            .iter()
            .map(|m| m.to_sql(self.rollup()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// What a replica is asked to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMutation {
    pub rollup: Option<String>,
    pub mutations: Vec<ColumnMutation>,
    /// Full column list after the change.
    pub target_columns: Vec<Column>,
    pub schema_version: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema conflict on {table}: {reason}")]
    Conflict { table: TableId, reason: String },

    #[error("schema change job {0} not found")]
    NotFound(JobId),

    #[error("cannot {operation} {job} while {state}")]
    InvalidState {
        job: JobId,
        state: JobState,
        operation: &'static str,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] LogError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Apply `mutations` to `schema` and return the resulting column list.
pub fn plan_columns(
    table: TableId,
    schema: &TableSchema,
    mutations: &[ColumnMutation],
) -> Result<Vec<Column>, SchemaError> {
    let conflict = |reason: String| SchemaError::Conflict { table, reason };
    if mutations.is_empty() {
        return Err(conflict("no column mutations".into()));
    }

    let mut columns = schema.columns.clone();
    for mutation in mutations {
        match mutation {
            ColumnMutation::AddColumn { column, position } => {
                if find(&columns, &column.name).is_some() {
                    return Err(conflict(format!("column `{}` already exists", column.name)));
                }
                check_definition(column).map_err(conflict)?;
                if column.aggregate.is_some() && *position == Some(ColumnPosition::First) {
                    return Err(conflict(format!(
                        "cannot add value column `{}` at first",
                        column.name
                    )));
                }
                insert(&mut columns, column.clone(), position.as_ref()).map_err(conflict)?;
            }
            ColumnMutation::DropColumn { name } => {
                let index = find(&columns, name)
                    .ok_or_else(|| conflict(format!("column `{name}` does not exist")))?;
                if columns[index].is_key {
                    return Err(conflict(format!("cannot drop key column `{name}`")));
                }
                if columns.len() == 1 {
                    return Err(conflict(format!("cannot drop the only column `{name}`")));
                }
                columns.remove(index);
            }
            ColumnMutation::ModifyColumn { column, position } => {
                let index = find(&columns, &column.name)
                    .ok_or_else(|| conflict(format!("column `{}` does not exist", column.name)))?;
                if columns[index].is_key != column.is_key {
                    return Err(conflict(format!(
                        "cannot change whether `{}` is a key column",
                        column.name
                    )));
                }
                check_definition(column).map_err(conflict)?;
                match position {
                    None => columns[index] = column.clone(),
                    Some(position) => {
                        columns.remove(index);
                        insert(&mut columns, column.clone(), Some(position)).map_err(conflict)?;
                    }
                }
            }
        }

        if let Some(misplaced) = columns
            .iter()
            .skip_while(|c| c.is_key)
            .find(|c| c.is_key)
        {
            return Err(conflict(format!(
                "key column `{}` must precede value columns",
                misplaced.name
            )));
        }
    }
    Ok(columns)
}

fn find(columns: &[Column], name: &str) -> Option<usize> {
    columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(name))
}

fn check_definition(column: &Column) -> Result<(), String> {
    if column.is_key && column.aggregate.is_some() {
        return Err(format!("key column `{}` cannot be aggregated", column.name));
    }
    if !column.nullable && column.default_value.is_none() {
        return Err(format!("no default value for not null column `{}`", column.name));
    }
    Ok(())
}

fn insert(
    columns: &mut Vec<Column>,
    column: Column,
    position: Option<&ColumnPosition>,
) -> Result<(), String> {
    let index = match position {
        Some(ColumnPosition::First) => 0,
        Some(ColumnPosition::After(anchor)) => {
            find(columns, anchor).ok_or_else(|| format!("column `{anchor}` does not exist"))? + 1
        }
        None if column.is_key => columns.iter().take_while(|c| c.is_key).count(),
        None => columns.len(),
    };
    columns.insert(index, column);
    Ok(())
}
