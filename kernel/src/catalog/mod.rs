// Catalog
//
// In-memory view of databases, tables, columns and partition placement.
// Creating databases and tables belongs to the DDL layer; the kernel reads
// placement when validating commits and swaps a table schema when a
// schema-change job finishes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ids::{DbId, PartitionId, ReplicaId, TableId};

/// Aggregation applied to a value column when rows with equal keys merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Sum,
    Min,
    Max,
    Replace,
    HllUnion,
    BitmapUnion,
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Replace => "REPLACE",
            Self::HllUnion => "HLL_UNION",
            Self::BitmapUnion => "BITMAP_UNION",
        };
        f.write_str(name)
    }
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub is_key: bool,
    #[serde(default)]
    pub aggregate: Option<AggregateType>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn key(name: &str, data_type: &str) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_key: true,
            aggregate: None,
            nullable: false,
            default_value: None,
        }
    }

    pub fn value(name: &str, data_type: &str) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_key: false,
            aggregate: None,
            nullable: true,
            default_value: None,
        }
    }

    pub fn with_aggregate(mut self, aggregate: AggregateType) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Render the column the way it appears in a column definition list.
    pub fn to_sql(&self) -> String {
        let mut sql = format!("`{}` {}", self.name, self.data_type);
        if self.is_key {
            sql.push_str(" KEY");
        }
        if let Some(aggregate) = self.aggregate {
            sql.push_str(&format!(" {aggregate}"));
        }
        sql.push_str(if self.nullable { " NULL" } else { " NOT NULL" });
        if let Some(default) = &self.default_value {
            sql.push_str(&format!(" DEFAULT \"{default}\""));
        }
        sql
    }
}

/// Versioned column list of a base table or one of its rollups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub version: u64,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            version: 1,
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// A schema installed by a finished job, kept in the state log so it
/// outlives the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub table: TableId,
    #[serde(default)]
    pub rollup: Option<String>,
    pub schema: TableSchema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub id: TableId,
    pub db: DbId,
    pub name: String,
    pub base: TableSchema,
    /// Materialized rollup indexes keyed by name.
    pub rollups: BTreeMap<String, TableSchema>,
    /// Partition → replica placement.
    pub partitions: BTreeMap<PartitionId, BTreeSet<ReplicaId>>,
}

impl Table {
    pub fn new(id: TableId, db: DbId, name: &str, columns: Vec<Column>) -> Self {
        Self {
            id,
            db,
            name: name.into(),
            base: TableSchema::new(columns),
            rollups: BTreeMap::new(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn with_partition(
        mut self,
        partition: PartitionId,
        replicas: impl IntoIterator<Item = ReplicaId>,
    ) -> Self {
        self.partitions
            .insert(partition, replicas.into_iter().collect());
        self
    }

    pub fn with_rollup(mut self, name: &str, columns: Vec<Column>) -> Self {
        self.rollups.insert(name.into(), TableSchema::new(columns));
        self
    }

    /// Schema of the base index (`None`) or the named rollup.
    pub fn schema(&self, rollup: Option<&str>) -> Option<&TableSchema> {
        match rollup {
            None => Some(&self.base),
            Some(name) => self.rollups.get(name),
        }
    }

    /// Every storage node holding at least one replica of this table.
    pub fn replicas(&self) -> BTreeSet<ReplicaId> {
        self.partitions.values().flatten().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    pub id: DbId,
    pub name: String,
    /// Hard storage limit in bytes.
    pub quota_bytes: u64,
    pub tables: BTreeSet<TableId>,
    /// System databases (information schema) hold no user data.
    pub system: bool,
}

impl Database {
    pub fn new(id: DbId, name: &str, quota_bytes: u64) -> Self {
        Self {
            id,
            name: name.into(),
            quota_bytes,
            tables: BTreeSet::new(),
            system: false,
        }
    }

    pub fn system(id: DbId, name: &str) -> Self {
        Self {
            system: true,
            ..Self::new(id, name, u64::MAX)
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("database {0} does not exist")]
    UnknownDatabase(DbId),

    #[error("table {0} does not exist")]
    UnknownTable(TableId),

    #[error("index `{index}` does not exist on {table}")]
    UnknownIndex { table: TableId, index: String },

    #[error("partition {partition} is already owned by {owner}")]
    PartitionTaken {
        partition: PartitionId,
        owner: TableId,
    },

    #[error("schema of {table} is at version {actual}, expected {expected}")]
    VersionMismatch {
        table: TableId,
        expected: u64,
        actual: u64,
    },
}

#[derive(Debug, Default)]
struct CatalogInner {
    databases: HashMap<DbId, Database>,
    tables: HashMap<TableId, Table>,
    partition_owner: HashMap<PartitionId, TableId>,
}

/// Shared catalog. Reads hand out clones so no lock escapes.
#[derive(Debug, Default)]
pub struct Catalog {
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database(&self, database: Database) {
        self.inner.write().databases.insert(database.id, database);
    }

    pub fn add_table(&self, table: Table) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        if !inner.databases.contains_key(&table.db) {
            return Err(CatalogError::UnknownDatabase(table.db));
        }
        for partition in table.partitions.keys() {
            if let Some(owner) = inner.partition_owner.get(partition) {
                if *owner != table.id {
                    return Err(CatalogError::PartitionTaken {
                        partition: *partition,
                        owner: *owner,
                    });
                }
            }
        }
        for partition in table.partitions.keys() {
            inner.partition_owner.insert(*partition, table.id);
        }
        if let Some(db) = inner.databases.get_mut(&table.db) {
            db.tables.insert(table.id);
        }
        inner.tables.insert(table.id, table);
        Ok(())
    }

    pub fn database(&self, id: DbId) -> Option<Database> {
        self.inner.read().databases.get(&id).cloned()
    }

    pub fn database_ids(&self) -> Vec<DbId> {
        let mut ids: Vec<_> = self.inner.read().databases.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn table(&self, id: TableId) -> Option<Table> {
        self.inner.read().tables.get(&id).cloned()
    }

    pub fn partition_owner(&self, partition: PartitionId) -> Option<TableId> {
        self.inner.read().partition_owner.get(&partition).copied()
    }

    pub fn partition_replicas(&self, partition: PartitionId) -> Option<BTreeSet<ReplicaId>> {
        let inner = self.inner.read();
        let table = inner.partition_owner.get(&partition)?;
        inner.tables.get(table)?.partitions.get(&partition).cloned()
    }

    pub fn set_quota(&self, db: DbId, quota_bytes: u64) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        let database = inner
            .databases
            .get_mut(&db)
            .ok_or(CatalogError::UnknownDatabase(db))?;
        database.quota_bytes = quota_bytes;
        Ok(())
    }

    /// Install a new column list planned against `base_version`; the stored
    /// schema moves to `base_version + 1`.
    ///
    /// Returns `Ok(false)` when the stored schema is already at that version.
    /// Any other version means the plan is stale and nothing is changed.
    pub fn swap_schema(
        &self,
        table: TableId,
        rollup: Option<&str>,
        columns: Vec<Column>,
        base_version: u64,
    ) -> Result<bool, CatalogError> {
        let mut inner = self.inner.write();
        let schema = schema_mut(&mut inner, table, rollup)?;
        let target = base_version + 1;
        if schema.version == target {
            return Ok(false);
        }
        if schema.version != base_version {
            return Err(CatalogError::VersionMismatch {
                table,
                expected: base_version,
                actual: schema.version,
            });
        }
        schema.columns = columns;
        schema.version = target;
        Ok(true)
    }

    /// Reinstall a recovered schema. Skipped when the stored schema is
    /// already at that version or later.
    pub fn install_schema(&self, installed: &IndexSchema) -> Result<bool, CatalogError> {
        let mut inner = self.inner.write();
        let schema = schema_mut(&mut inner, installed.table, installed.rollup.as_deref())?;
        if schema.version >= installed.schema.version {
            return Ok(false);
        }
        *schema = installed.schema.clone();
        Ok(true)
    }
}

fn schema_mut<'a>(
    inner: &'a mut CatalogInner,
    table: TableId,
    rollup: Option<&str>,
) -> Result<&'a mut TableSchema, CatalogError> {
    let entry = inner
        .tables
        .get_mut(&table)
        .ok_or(CatalogError::UnknownTable(table))?;
    match rollup {
        None => Ok(&mut entry.base),
        Some(name) => entry
            .rollups
            .get_mut(name)
            .ok_or_else(|| CatalogError::UnknownIndex {
                table,
                index: name.into(),
            }),
    }
}
