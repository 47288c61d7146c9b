//! Wiring of the data-access services from one [`Config`].

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, DriveService, SheetsService, DRIVE_API_BASE, SHEETS_API_BASE};
use crate::cache::{CacheStore, FetchOptions, Orchestrator, PersistentStore, FILES_NAMESPACE, SHEETS_NAMESPACE};
use crate::config::Config;
use crate::error::{FetchResult, StorageError};
use crate::http::Transport;
use crate::prefetch::{PrefetchScheduler, PrefetchTarget};

/// Depth of the folder trees warmed at startup.
const PREFETCH_FOLDER_DEPTH: usize = 2;

/// Both services plus the durable tier they share.
#[derive(Clone)]
pub struct DataServices {
    pub sheets: SheetsService,
    pub drive: DriveService,
    persistent: Arc<PersistentStore>,
}

impl DataServices {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        persistent: Arc<PersistentStore>,
    ) -> FetchResult<Self> {
        let sheets_client = ApiClient::new(Arc::clone(&transport), SHEETS_API_BASE, config.sheets_key())?;
        let sheets = SheetsService::new(
            sheets_client,
            config.spreadsheet_id.as_deref(),
            Orchestrator::new(
                Arc::new(CacheStore::new(config.tabular)),
                Some(Arc::clone(&persistent)),
                SHEETS_NAMESPACE,
            ),
        );

        let drive_client = ApiClient::new(transport, DRIVE_API_BASE, config.drive_key())?;
        let drive = DriveService::new(
            drive_client,
            Orchestrator::new(
                Arc::new(CacheStore::new(config.files)),
                Some(Arc::clone(&persistent)),
                FILES_NAMESPACE,
            ),
        );

        debug!(
            sheets_configured = sheets.is_configured(),
            drive_configured = drive.is_configured(),
            "Data services ready"
        );
        Ok(Self {
            sheets,
            drive,
            persistent,
        })
    }

    pub fn persistent(&self) -> &PersistentStore {
        &self.persistent
    }

    /// The startup warm-up: configured sheets, then configured folder trees.
    /// A target whose source has no credentials is reported as skipped.
    pub fn prefetch_scheduler(&self, config: &Config) -> PrefetchScheduler {
        let sheets_target = if self.sheets.is_configured() {
            let sheets = self.sheets.clone();
            let names = config.prefetch_sheets.clone();
            PrefetchTarget::new("sheets", move || {
                let sheets = sheets.clone();
                let names = names.clone();
                async move { sheets.prefetch(&names).await }
            })
        } else {
            PrefetchTarget::unconfigured("sheets")
        };

        let folders_target = if self.drive.is_configured() {
            let drive = self.drive.clone();
            let folders = config.prefetch_folders.clone();
            PrefetchTarget::new("folders", move || {
                let drive = drive.clone();
                let folders = folders.clone();
                async move { prefetch_folders(&drive, &folders).await }
            })
        } else {
            PrefetchTarget::unconfigured("folders")
        };

        PrefetchScheduler::new(vec![sheets_target, folders_target])
    }

    /// Drop every in-memory entry. The durable tier is kept.
    pub fn invalidate_all(&self) {
        self.sheets.orchestrator().clear();
        self.drive.orchestrator().clear();
        info!("In-memory caches cleared");
    }

    /// Drop every in-memory entry and every durable record.
    pub async fn wipe_all(&self) -> Result<(), StorageError> {
        self.invalidate_all();
        self.persistent.wipe().await?;
        info!("Durable cache wiped");
        Ok(())
    }

    /// Wait for background revalidations in both services.
    pub async fn settle(&self) {
        self.sheets.orchestrator().settle().await;
        self.drive.orchestrator().settle().await;
    }
}

/// Every folder tree is fetched concurrently. The target fails only when
/// every folder failed.
async fn prefetch_folders(drive: &DriveService, folders: &[String]) -> FetchResult<()> {
    let mut fetches = Vec::with_capacity(folders.len());
    for folder in folders {
        fetches.push(drive.folder_structure(folder, PREFETCH_FOLDER_DEPTH, FetchOptions::default()));
    }

    let mut first_error = None;
    let mut succeeded = 0;
    for (folder, result) in folders.iter().zip(join_all(fetches).await) {
        match result {
            Ok(_) => succeeded += 1,
            Err(e) => {
                warn!(folder = %folder, error = %e, "Folder prefetch failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if succeeded == 0 => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FetchSource;
    use crate::http::testing::ScriptedTransport;
    use crate::prefetch::PrefetchStatus;
    use serde_json::json;
    use std::time::Duration;

    fn services(config: &Config) -> (DataServices, ScriptedTransport, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = ScriptedTransport::new();
        let persistent = Arc::new(PersistentStore::new(dir.path().to_path_buf()));
        let services = DataServices::new(config, Arc::new(transport.clone()), persistent).unwrap();
        (services, transport, dir)
    }

    fn configured() -> Config {
        Config {
            sheets_api_key: Some("k".to_string()),
            drive_api_key: Some("k".to_string()),
            spreadsheet_id: Some("sheet-1".to_string()),
            prefetch_sheets: vec!["supply".to_string()],
            prefetch_folders: vec!["root".to_string(), "missing".to_string()],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_unconfigured_targets_are_skipped() {
        let config = Config::default();
        let (services, transport, _dir) = services(&config);
        let scheduler = services.prefetch_scheduler(&config);

        scheduler.start();
        let snapshot = scheduler
            .wait_for_completion(Duration::from_millis(100))
            .await
            .expect("started");
        assert_eq!(snapshot.status("sheets"), Some(PrefetchStatus::Skipped));
        assert_eq!(snapshot.status("folders"), Some(PrefetchStatus::Skipped));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_warms_both_namespaces() {
        let config = configured();
        let (services, transport, _dir) = services(&config);
        transport.route_json(
            "https://sheets.googleapis.com/v4/spreadsheets/sheet-1/values/supply",
            json!({"values": [["Item"], ["Rope"]]}),
        );
        transport.route_json(
            "https://www.googleapis.com/drive/v3/files/root",
            json!({"id": "root", "name": "Root", "mimeType": "application/vnd.google-apps.folder"}),
        );
        transport.route_json("https://www.googleapis.com/drive/v3/files?", json!({"files": []}));

        let scheduler = services.prefetch_scheduler(&config);
        scheduler.start();
        let snapshot = scheduler
            .wait_for_completion(Duration::from_secs(5))
            .await
            .expect("started");

        assert_eq!(snapshot.status("sheets"), Some(PrefetchStatus::Complete));
        // "missing" 404s, but one folder tree succeeded
        assert_eq!(snapshot.status("folders"), Some(PrefetchStatus::Complete));

        let supply = services
            .sheets
            .get_sheet("supply", None, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(supply.source, FetchSource::CacheFresh);
        assert_eq!(services.drive.stats().cache.total, 1);
    }

    #[tokio::test]
    async fn test_wipe_all_clears_both_tiers() {
        let config = configured();
        let (services, transport, _dir) = services(&config);
        transport.route_json(
            "https://sheets.googleapis.com/v4/spreadsheets/sheet-1/values/supply",
            json!({"values": [["Item"], ["Rope"]]}),
        );
        services
            .sheets
            .get_sheet("supply", None, FetchOptions::default())
            .await
            .unwrap();
        assert!(services.persistent().usage_bytes().await.unwrap() > 0);

        services.invalidate_all();
        assert_eq!(services.sheets.stats().cache.total, 0);
        assert!(services.persistent().usage_bytes().await.unwrap() > 0);

        services.wipe_all().await.unwrap();
        assert_eq!(services.persistent().usage_bytes().await.unwrap(), 0);

        transport.set_offline(true);
        let offline = services
            .sheets
            .get_sheet("supply", None, FetchOptions::default())
            .await;
        assert!(offline.unwrap_err().is_network_unavailable());
    }
}
