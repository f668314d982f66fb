//! Partition schemas and the partition routing table
//!
//! A catalog file declares one schema template and the allow-listed set of
//! partition keys it applies to. Every partition gets its own production,
//! staging and retired table name, derived once here and validated as SQL
//! identifiers. Nothing downstream builds table names from strings.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use crate::error::{IngestError, Result};

#[allow(clippy::unwrap_used)]
static TABLE_IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap());

#[allow(clippy::unwrap_used)]
static COLUMN_IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap());

#[allow(clippy::unwrap_used)]
static PARTITION_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z0-9]{1,16}$").unwrap());

/// Primitive type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Timestamp,
}

impl FieldType {
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::String => "TEXT",
            FieldType::Integer => "BIGINT",
            FieldType::Timestamp => "TIMESTAMPTZ",
        }
    }
}

/// One declared column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Ordered, immutable set of typed fields for one partition
#[derive(Debug, Clone)]
pub struct PartitionSchema {
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
    natural_key: Vec<String>,
}

impl PartitionSchema {
    /// Build a schema, rejecting duplicate or unsafe field names and a natural
    /// key that references undeclared fields.
    pub fn new(fields: Vec<FieldSpec>, natural_key: Vec<String>) -> Result<Self> {
        if fields.is_empty() {
            return Err(IngestError::Schema("schema declares no fields".into()));
        }

        let mut index = HashMap::with_capacity(fields.len());
        for (position, field) in fields.iter().enumerate() {
            if !COLUMN_IDENT.is_match(&field.name) {
                return Err(IngestError::InvalidIdentifier(field.name.clone()));
            }
            if index.insert(field.name.clone(), position).is_some() {
                return Err(IngestError::Schema(format!(
                    "field '{}' is declared twice",
                    field.name
                )));
            }
        }

        if natural_key.is_empty() {
            return Err(IngestError::Schema(
                "natural key must name at least one field".into(),
            ));
        }
        let mut seen = HashSet::new();
        for key in &natural_key {
            if !index.contains_key(key) {
                return Err(IngestError::Schema(format!(
                    "natural key field '{}' is not declared",
                    key
                )));
            }
            if !seen.insert(key) {
                return Err(IngestError::Schema(format!(
                    "natural key field '{}' is listed twice",
                    key
                )));
            }
        }

        Ok(Self {
            fields,
            index,
            natural_key,
        })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.field(name).map(|f| f.field_type)
    }

    pub fn natural_key(&self) -> &[String] {
        &self.natural_key
    }

    /// Natural-key fields are always required
    pub fn is_required(&self, name: &str) -> bool {
        self.field(name).is_some_and(|f| f.required) || self.natural_key.iter().any(|k| k == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .filter(|name| self.is_required(name))
    }
}

/// A validated, lowercase SQL table identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if TABLE_IDENT.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(IngestError::InvalidIdentifier(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for interpolation into DDL/DML
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Physical tables owned by one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableNames {
    /// Canonical name readers query
    pub production: Identifier,
    /// Where a load in progress writes
    pub staging: Identifier,
    /// Transient name for the previous production table during cutover
    pub retired: Identifier,
}

impl TableNames {
    pub fn for_partition(prefix: &str, key: &str) -> Result<Self> {
        let base = format!("{}_{}", prefix.to_lowercase(), key.to_lowercase());
        Ok(Self {
            production: Identifier::new(base.clone())?,
            staging: Identifier::new(format!("{}_staging", base))?,
            retired: Identifier::new(format!("{}_old", base))?,
        })
    }
}

/// Everything needed to load one partition
#[derive(Debug, Clone)]
pub struct PartitionRoute {
    pub key: String,
    pub schema: Arc<PartitionSchema>,
    pub tables: TableNames,
}

/// Schema template as written in the catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaTemplate {
    pub fields: Vec<FieldSpec>,
    pub natural_key: Vec<String>,
}

/// On-disk catalog of partitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    pub table_prefix: String,
    #[serde(flatten)]
    pub template: SchemaTemplate,
    pub partitions: Vec<String>,
    /// Per-partition schema replacing the template
    #[serde(default)]
    pub overrides: HashMap<String, SchemaTemplate>,
}

/// Allow-listed mapping from partition key to its route
#[derive(Debug, Clone, Default)]
pub struct PartitionRegistry {
    routes: BTreeMap<String, Arc<PartitionRoute>>,
}

impl PartitionRegistry {
    pub fn from_catalog(catalog: CatalogFile) -> Result<Self> {
        let template = Arc::new(PartitionSchema::new(
            catalog.template.fields,
            catalog.template.natural_key,
        )?);

        let mut registry = Self::default();
        for raw_key in catalog.partitions {
            let key = normalize_key(&raw_key)?;
            let schema = match catalog.overrides.get(&key).or_else(|| catalog.overrides.get(&raw_key)) {
                Some(over) => Arc::new(PartitionSchema::new(
                    over.fields.clone(),
                    over.natural_key.clone(),
                )?),
                None => template.clone(),
            };
            registry.insert(&catalog.table_prefix, &key, schema)?;
        }

        Ok(registry)
    }

    /// Read a JSON catalog file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(tabload_common::TabloadError::from)?;
        let catalog: CatalogFile =
            serde_json::from_str(&raw).map_err(tabload_common::TabloadError::from)?;
        Self::from_catalog(catalog)
    }

    /// Register one partition
    pub fn insert(&mut self, prefix: &str, key: &str, schema: Arc<PartitionSchema>) -> Result<()> {
        let key = normalize_key(key)?;
        let tables = TableNames::for_partition(prefix, &key)?;
        if self.routes.contains_key(&key) {
            return Err(IngestError::Schema(format!("partition {} listed twice", key)));
        }
        self.routes.insert(
            key.clone(),
            Arc::new(PartitionRoute {
                key,
                schema,
                tables,
            }),
        );
        Ok(())
    }

    /// Look up a partition, rejecting anything outside the catalog
    pub fn route(&self, key: &str) -> Result<Arc<PartitionRoute>> {
        let normalized = key.trim().to_uppercase();
        self.routes
            .get(&normalized)
            .cloned()
            .ok_or_else(|| IngestError::UnknownPartition(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.routes.contains_key(&key.trim().to_uppercase())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn normalize_key(key: &str) -> Result<String> {
    let key = key.trim().to_uppercase();
    if PARTITION_KEY.is_match(&key) {
        Ok(key)
    } else {
        Err(IngestError::UnknownPartition(key))
    }
}
