//! Entity descriptors and the delete feed, loaded from `entities.yaml`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use erpsync_core::{ensure_identifier, ConfigError, Pagination, ParamSpec, ParamValue, SyncDescriptor};
use serde::{Deserialize, Serialize};

/// Longest delete window accepted from config or the command line, ten years.
pub const MAX_LOOKBACK_HOURS: i64 = 24 * 366 * 10;

fn default_table_field() -> String {
    "UD14_Key4".to_string()
}

fn default_row_id_field() -> String {
    "UD14_Key1".to_string()
}

fn default_row_id_column() -> String {
    "sysrowid".to_string()
}

fn default_lookback_hours() -> i64 {
    6
}

fn default_page_size() -> usize {
    5000
}

fn default_delete_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("OffsetNum", ParamValue::Offset),
        ParamSpec::new("FetchNum", ParamValue::PageSize),
        ParamSpec::new("EpochTimeStamp", ParamValue::EpochTimestamp),
    ]
}

/// Upstream feed of deleted rows, applied to allow-listed tables only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteFeedConfig {
    pub endpoint: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_table_field")]
    pub table_field: String,
    #[serde(default = "default_row_id_field")]
    pub row_id_field: String,
    #[serde(default = "default_row_id_column")]
    pub row_id_column: String,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_delete_params")]
    pub params: Vec<ParamSpec>,
    pub allowed_tables: Vec<String>,
}

impl DeleteFeedConfig {
    pub fn allows(&self, table: &str) -> bool {
        self.allowed_tables.iter().any(|t| t == table)
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::Offset {
            page_size: self.page_size,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidDescriptor {
            entity: "delete_feed".to_string(),
            message,
        };
        ensure_identifier(&self.row_id_column)?;
        for table in &self.allowed_tables {
            ensure_identifier(table)?;
        }
        if self.page_size == 0 {
            return Err(invalid("page size must be at least 1".into()));
        }
        if !(0..=MAX_LOOKBACK_HOURS).contains(&self.lookback_hours) {
            return Err(invalid(format!(
                "lookback hours must be between 0 and {MAX_LOOKBACK_HOURS}"
            )));
        }
        if self
            .params
            .iter()
            .any(|p| matches!(p.value, ParamValue::Cursor))
        {
            return Err(invalid("delete feed pages by offset, not by cursor".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    pub name: String,
    pub table: String,
    pub endpoint: String,
    pub pagination: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRegistry {
    pub entities: Vec<SyncDescriptor>,
    #[serde(default)]
    pub delete_feed: Option<DeleteFeedConfig>,
}

impl EntityRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: EntityRegistry =
            serde_yaml::from_str(text).context("parsing entity registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for descriptor in &self.entities {
            descriptor.validate()?;
            if !names.insert(descriptor.name.to_ascii_lowercase()) {
                return Err(ConfigError::InvalidDescriptor {
                    entity: descriptor.name.clone(),
                    message: "entity name is defined twice".to_string(),
                });
            }
        }
        if let Some(feed) = &self.delete_feed {
            feed.validate()?;
        }
        Ok(())
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Result<&SyncDescriptor, ConfigError> {
        self.entities
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ConfigError::UnknownEntity(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|d| d.name.as_str())
    }

    pub fn summaries(&self) -> Vec<EntitySummary> {
        self.entities
            .iter()
            .map(|d| EntitySummary {
                name: d.name.clone(),
                table: d.table.clone(),
                endpoint: d.endpoint.clone(),
                pagination: match d.pagination {
                    Pagination::Offset { .. } => "offset",
                    Pagination::Sequence { .. } => "sequence",
                },
                schedule: d.schedule.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erpsync_core::FilterDefaults;
    use std::io::Write;

    const REGISTRY: &str = r#"
entities:
  - name: warehouse
    table: warehouse
    endpoint: /ETL_Warehouse/Data
    schedule: "0 15 1 * * *"
    pagination: { mode: offset, page_size: 1000 }
    params:
      - { name: OffsetNum, value: offset }
      - { name: FetchNum, value: page_size }
    columns:
      - { column: warehousecode, field: Warehse_WarehouseCode, kind: raw }
      - { column: description, field: Warehse_Description, kind: raw }
    key_columns: [warehousecode]
  - name: parttran
    table: parttran
    endpoint: /ETL_PartTran/Data
    pagination: { mode: sequence, field: PartTran_TranNum, column: trannum }
    params:
      - { name: StartTranNum, value: cursor }
    columns:
      - { column: trannum, field: PartTran_TranNum, kind: int }
      - { column: partnum, field: PartTran_PartNum, kind: raw }
    key_columns: [trannum]
    conflict: insert_ignore
delete_feed:
  endpoint: /ETL_DeleteRec/Data
  allowed_tables: [parttran, warehouse]
"#;

    #[test]
    fn loads_entities_and_delete_feed_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REGISTRY.as_bytes()).unwrap();

        let registry = EntityRegistry::load(file.path()).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["warehouse", "parttran"]);
        assert_eq!(registry.get("PartTran").unwrap().page_size(), 5000);

        let feed = registry.delete_feed.unwrap();
        assert_eq!(feed.table_field, "UD14_Key4");
        assert_eq!(feed.row_id_column, "sysrowid");
        assert_eq!(feed.lookback_hours, 6);
        assert_eq!(feed.params.len(), 3);
        assert!(feed.allows("parttran"));
        assert!(!feed.allows("users"));
    }

    #[test]
    fn summaries_describe_each_entity() {
        let registry = EntityRegistry::from_yaml_str(REGISTRY).unwrap();
        let summaries = registry.summaries();
        assert_eq!(summaries[0].pagination, "offset");
        assert_eq!(summaries[0].schedule.as_deref(), Some("0 15 1 * * *"));
        assert_eq!(summaries[1].pagination, "sequence");
    }

    #[test]
    fn unknown_entity_is_a_config_error() {
        let registry = EntityRegistry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(
            registry.get("nope").unwrap_err(),
            ConfigError::UnknownEntity("nope".into())
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = EntityRegistry::from_yaml_str(REGISTRY).unwrap();
        let mut copy = registry.entities[0].clone();
        copy.name = "WAREHOUSE".into();
        registry.entities.push(copy);
        assert!(matches!(
            registry.validate(),
            Err(ConfigError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn shipped_registry_is_valid() {
        let registry = EntityRegistry::from_yaml_str(include_str!("../../../entities.yaml")).unwrap();
        assert_eq!(registry.entities.len(), 25);
        assert!(registry.entities.iter().all(|d| d.schedule.is_some()));

        let feed = registry.delete_feed.as_ref().unwrap();
        assert_eq!(feed.allowed_tables.len(), 18);
        for table in &feed.allowed_tables {
            assert!(
                registry.entities.iter().any(|d| &d.table == table),
                "{table} receives deletes but no entity fills it"
            );
        }
    }

    #[test]
    fn shipped_today_defaults_match_the_upstream_controllers() {
        let registry = EntityRegistry::from_yaml_str(include_str!("../../../entities.yaml")).unwrap();
        let today: Vec<&str> = registry
            .entities
            .iter()
            .filter(|d| d.default_filters == FilterDefaults::Today)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(today, vec!["part", "podetail", "ud11"]);
        assert_eq!(registry.get("rcvdtl").unwrap().columns.len(), 106);
    }

    #[test]
    fn lookback_outside_the_window_fails_to_load() {
        for hours in ["-1", "9000000000000000"] {
            let text = REGISTRY.replace(
                "  allowed_tables: [parttran, warehouse]",
                &format!("  lookback_hours: {hours}\n  allowed_tables: [parttran, warehouse]"),
            );
            assert!(EntityRegistry::from_yaml_str(&text).is_err(), "{hours} was accepted");
        }
        let text = REGISTRY.replace(
            "  allowed_tables: [parttran, warehouse]",
            &format!("  lookback_hours: {MAX_LOOKBACK_HOURS}\n  allowed_tables: [parttran, warehouse]"),
        );
        assert!(EntityRegistry::from_yaml_str(&text).is_ok());
    }

    #[test]
    fn unsafe_allowed_table_fails_to_load() {
        let text = REGISTRY.replace("[parttran, warehouse]", "[\"parttran; drop table x\"]");
        assert!(EntityRegistry::from_yaml_str(&text).is_err());
    }
}
