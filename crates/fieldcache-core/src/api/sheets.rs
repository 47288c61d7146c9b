//! Tabular data from the Sheets values API.
//!
//! A sheet is fetched as a grid of strings and normalized into
//! [`SheetRow`]s here, before it ever reaches the cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::ApiClient;
use crate::cache::{CacheKey, FetchOptions, FetchOutcome, FetchSource, Orchestrator, OrchestratorStats};
use crate::error::{FetchError, FetchResult};

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// Cache namespace for sheet keys.
pub const SHEET_NAMESPACE: &str = "sheet";

/// Columns read when no explicit range is given.
const DEFAULT_COLUMNS: &str = "A:Z";

/// One data row. Each cell is keyed by its original header and, when
/// different, by the normalized header as well. Cells stay nested so no
/// header can collide with `row_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    /// Row number in the sheet; the header is row 1.
    pub row_index: usize,
    pub cells: BTreeMap<String, String>,
}

impl SheetRow {
    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .get(header)
            .or_else(|| self.cells.get(&normalize_header(header)))
            .map(String::as_str)
    }

    /// Case-insensitive substring match on `fields`, or on every cell.
    fn matches(&self, term: &str, fields: Option<&[&str]>) -> bool {
        match fields {
            Some(fields) => fields
                .iter()
                .any(|f| self.get(f).is_some_and(|v| v.to_lowercase().contains(term))),
            None => self.cells.values().any(|v| v.to_lowercase().contains(term)),
        }
    }
}

/// Lowercase ASCII alphanumerics only: "Item Name" -> "itemname".
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            c.is_ascii_alphanumeric().then_some(c)
        })
        .collect()
}

/// First row is the header; missing trailing cells become empty strings.
pub fn parse_values(values: &[Vec<String>]) -> Vec<SheetRow> {
    let Some((headers, rows)) = values.split_first() else {
        return Vec::new();
    };
    let headers: Vec<(&str, String)> = headers
        .iter()
        .map(|h| (h.as_str(), normalize_header(h)))
        .collect();

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let mut cells = BTreeMap::new();
            for (col, (original, normalized)) in headers.iter().enumerate() {
                let value = row.get(col).cloned().unwrap_or_default();
                if !normalized.is_empty() && normalized.as_str() != *original {
                    cells.insert(normalized.clone(), value.clone());
                }
                cells.insert(original.to_string(), value);
            }
            SheetRow {
                row_index: i + 2,
                cells,
            }
        })
        .collect()
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

pub type SheetOutcome = FetchOutcome<Vec<SheetRow>>;

#[derive(Clone)]
pub struct SheetsService {
    client: Arc<ApiClient>,
    spreadsheet_id: Option<String>,
    orchestrator: Orchestrator<Vec<SheetRow>>,
}

impl SheetsService {
    pub fn new(
        client: ApiClient,
        spreadsheet_id: Option<&str>,
        orchestrator: Orchestrator<Vec<SheetRow>>,
    ) -> Self {
        Self {
            client: Arc::new(client),
            spreadsheet_id: spreadsheet_id.map(str::to_string),
            orchestrator,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_configured() && self.spreadsheet_id.is_some()
    }

    pub fn orchestrator(&self) -> &Orchestrator<Vec<SheetRow>> {
        &self.orchestrator
    }

    fn spreadsheet_id(&self) -> FetchResult<&str> {
        if !self.client.is_configured() {
            return Err(FetchError::Configuration(
                "Sheets API key is not configured".to_string(),
            ));
        }
        self.spreadsheet_id
            .as_deref()
            .ok_or_else(|| FetchError::Configuration("Spreadsheet ID is not configured".to_string()))
    }

    /// A whole sheet is keyed by its name alone, which is also its durable id.
    fn key(name: &str, range: Option<&str>) -> FetchResult<CacheKey> {
        match range {
            None => Ok(CacheKey::from_id(SHEET_NAMESPACE, name)),
            Some(range) => CacheKey::new(SHEET_NAMESPACE, &(name, range))
                .map_err(|e| FetchError::Internal(format!("Failed to build cache key: {}", e))),
        }
    }

    pub async fn get_sheet(
        &self,
        name: &str,
        range: Option<&str>,
        options: FetchOptions<Vec<SheetRow>>,
    ) -> FetchResult<SheetOutcome> {
        let spreadsheet_id = self.spreadsheet_id()?.to_string();
        let key = Self::key(name, range)?;
        let range = range
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}!{}", name, DEFAULT_COLUMNS));
        let client = Arc::clone(&self.client);

        let producer = move || async move {
            let url = client.url(&[spreadsheet_id.as_str(), "values", range.as_str()], &[])?;
            let grid: ValueRange = client.get_json(url).await?;
            Ok(parse_values(&grid.values))
        };
        self.orchestrator.fetch_with(&key, producer, options).await
    }

    /// Fetch several whole sheets at once. Fresh entries are answered from
    /// memory; the rest are fetched concurrently. A failed sheet is reported
    /// in its own slot without failing the batch.
    pub async fn get_multiple(
        &self,
        names: &[&str],
        force_refresh: bool,
    ) -> FetchResult<BTreeMap<String, FetchResult<SheetOutcome>>> {
        self.spreadsheet_id()?;
        let mut results = BTreeMap::new();
        let mut pending = Vec::new();

        for name in names {
            let key = CacheKey::from_id(SHEET_NAMESPACE, *name);
            let fresh = if force_refresh {
                None
            } else {
                self.orchestrator
                    .cache()
                    .get(&key)
                    .filter(|hit| hit.is_fresh)
            };
            match fresh {
                Some(hit) => {
                    results.insert(
                        name.to_string(),
                        Ok(FetchOutcome {
                            data: hit.payload,
                            source: FetchSource::CacheFresh,
                        }),
                    );
                }
                None => pending.push(*name),
            }
        }

        let mut fetches = Vec::with_capacity(pending.len());
        for name in &pending {
            let options = if force_refresh {
                FetchOptions::force_refresh()
            } else {
                FetchOptions::default()
            };
            fetches.push(self.get_sheet(name, None, options));
        }
        let fetched = join_all(fetches).await;

        for (name, result) in pending.into_iter().zip(fetched) {
            if let Err(e) = &result {
                warn!(sheet = name, error = %e, "Failed to fetch sheet");
            }
            results.insert(name.to_string(), result);
        }
        Ok(results)
    }

    /// Filter a sheet locally; no extra request when the sheet is cached.
    pub async fn search(
        &self,
        name: &str,
        term: &str,
        fields: Option<&[&str]>,
    ) -> FetchResult<SheetOutcome> {
        let outcome = self.get_sheet(name, None, FetchOptions::default()).await?;
        if term.is_empty() {
            return Ok(outcome);
        }
        let term = term.to_lowercase();
        Ok(outcome.map(|rows| {
            rows.into_iter()
                .filter(|row| row.matches(&term, fields))
                .collect()
        }))
    }

    pub fn invalidate(&self, name: Option<&str>) {
        match name {
            Some(name) => {
                self.orchestrator
                    .invalidate(&CacheKey::from_id(SHEET_NAMESPACE, name));
                debug!(sheet = name, "Sheet cache invalidated");
            }
            None => {
                let cleared = self.orchestrator.invalidate_namespace(SHEET_NAMESPACE);
                debug!(cleared = cleared, "All sheet cache cleared");
            }
        }
    }

    /// Warm the cache for `names`. Only a missing configuration fails.
    pub async fn prefetch(&self, names: &[String]) -> FetchResult<()> {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        debug!(sheets = ?names, "Prefetching sheets");
        self.get_multiple(&names, false).await.map(|_| ())
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.orchestrator.stats()
    }
}
