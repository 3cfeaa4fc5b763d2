//! In-memory upstream and warehouse doubles for driver tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use erpsync_core::coerce::as_int;
use erpsync_core::{ConflictAction, RawRecord, Row, TableContract};
use erpsync_source::{FetchError, PageSource};
use erpsync_store::{validate_batch, Warehouse, WriteError};
use serde_json::Value;

use crate::engine::{EngineSettings, SyncEngine};
use crate::registry::EntityRegistry;

pub fn registry(yaml: &str) -> EntityRegistry {
    EntityRegistry::from_yaml_str(yaml).unwrap()
}

pub fn engine(
    erp: &FakeErp,
    warehouse: &MemoryWarehouse,
    registry: EntityRegistry,
    batch_size: usize,
) -> SyncEngine {
    SyncEngine::new(
        Arc::new(erp.clone()),
        Arc::new(warehouse.clone()),
        Arc::new(registry),
        EngineSettings {
            batch_size,
            run_timeout: Duration::from_secs(10),
        },
    )
}

#[derive(Default)]
struct ErpState {
    records: HashMap<String, Vec<RawRecord>>,
    cursors: HashMap<String, (String, String)>,
    failures: Vec<(String, String, u16)>,
    calls: Vec<(String, Vec<(String, String)>)>,
    delay: Option<Duration>,
}

/// Serves `OffsetNum`/`FetchNum` slices, or cursor-filtered slices for
/// endpoints registered with [`FakeErp::with_cursor`].
#[derive(Clone, Default)]
pub struct FakeErp {
    state: Arc<Mutex<ErpState>>,
}

impl FakeErp {
    pub fn with_records(self, endpoint: &str, records: Vec<Value>) -> Self {
        let records = records
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        self.state
            .lock()
            .unwrap()
            .records
            .insert(endpoint.to_string(), records);
        self
    }

    pub fn with_cursor(self, endpoint: &str, param: &str, field: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .cursors
            .insert(endpoint.to_string(), (param.to_string(), field.to_string()));
        self
    }

    pub fn fail_when(self, param: &str, value: &str, status: u16) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((param.to_string(), value.to_string(), status));
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().delay = Some(delay);
        self
    }

    pub fn param_values(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|(_, q)| q.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()))
            .collect()
    }
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

#[async_trait]
impl PageSource for FakeErp {
    async fn fetch_page(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<RawRecord>, FetchError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((endpoint.to_string(), params.to_vec()));
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        for (name, value, status) in &state.failures {
            if param(params, name) == Some(value.as_str()) {
                return Err(FetchError::HttpStatus {
                    status: *status,
                    url: endpoint.to_string(),
                    body: r#"{"error":"unavailable"}"#.to_string(),
                });
            }
        }

        let records = state.records.get(endpoint).cloned().unwrap_or_default();
        let size = param(params, "FetchNum")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(usize::MAX);

        if let Some((cursor_param, field)) = state.cursors.get(endpoint) {
            let from = param(params, cursor_param)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(i64::MIN);
            let mut matching: Vec<RawRecord> = records
                .into_iter()
                .filter(|r| as_int(r, field, i64::MIN) >= from)
                .collect();
            matching.sort_by_key(|r| as_int(r, field, i64::MIN));
            return Ok(matching.into_iter().take(size).collect());
        }

        let offset = param(params, "OffsetNum")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        Ok(records.into_iter().skip(offset).take(size).collect())
    }
}

struct Table {
    columns: Vec<String>,
    rows: BTreeMap<Vec<String>, Row>,
}

#[derive(Default)]
struct WarehouseState {
    tables: HashMap<String, Table>,
    writes: usize,
    fail_on_write: Option<usize>,
    fail_deletes_on: Option<String>,
}

/// Upserts keyed by the contract's key columns, all-or-nothing per batch.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

impl MemoryWarehouse {
    /// Fails the n-th `write_batch` call (1-based).
    pub fn fail_on_write(self, n: usize) -> Self {
        self.state.lock().unwrap().fail_on_write = Some(n);
        self
    }

    pub fn fail_deletes_on(self, table: &str) -> Self {
        self.state.lock().unwrap().fail_deletes_on = Some(table.to_string());
        self
    }

    pub fn seed(&self, contract: &TableContract, rows: Vec<Row>) {
        let mut state = self.state.lock().unwrap();
        apply(&mut state, contract, &rows);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn snapshot(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn apply(state: &mut WarehouseState, contract: &TableContract, rows: &[Row]) -> u64 {
    let key_idx: Vec<usize> = contract
        .key_columns
        .iter()
        .filter_map(|k| contract.columns.iter().position(|c| c == k))
        .collect();
    let table = state
        .tables
        .entry(contract.table.clone())
        .or_insert_with(|| Table {
            columns: contract.columns.clone(),
            rows: BTreeMap::new(),
        });
    let mut affected = 0;
    for row in rows {
        let key: Vec<String> = key_idx.iter().map(|i| row[*i].to_string()).collect();
        match contract.conflict {
            ConflictAction::Upsert => {
                table.rows.insert(key, row.clone());
                affected += 1;
            }
            ConflictAction::InsertIgnore => {
                if !table.rows.contains_key(&key) {
                    table.rows.insert(key, row.clone());
                    affected += 1;
                }
            }
        }
    }
    affected
}

fn injected(table: &str) -> WriteError {
    WriteError::Database {
        table: table.to_string(),
        source: sqlx::Error::Protocol("injected failure".to_string()),
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn write_batch(&self, contract: &TableContract, rows: &[Row]) -> Result<u64, WriteError> {
        validate_batch(contract, rows)?;
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        if state.fail_on_write == Some(state.writes) {
            return Err(injected(&contract.table));
        }
        Ok(apply(&mut state, contract, rows))
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<i64>, WriteError> {
        let state = self.state.lock().unwrap();
        let Some(t) = state.tables.get(table) else {
            return Ok(None);
        };
        let Some(idx) = t.columns.iter().position(|c| c == column) else {
            return Ok(None);
        };
        Ok(t.rows.values().filter_map(|r| r[idx].as_i64()).max())
    }

    async fn delete_by_row_id(
        &self,
        table: &str,
        row_id_column: &str,
        row_id: &str,
    ) -> Result<u64, WriteError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes_on.as_deref() == Some(table) {
            return Err(injected(table));
        }
        let Some(t) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let Some(idx) = t.columns.iter().position(|c| c == row_id_column) else {
            return Ok(0);
        };
        let before = t.rows.len();
        t.rows.retain(|_, row| row[idx].to_string() != row_id);
        Ok((before - t.rows.len()) as u64)
    }
}
