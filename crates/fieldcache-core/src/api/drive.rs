//! Hierarchical file data from the Drive v3 API.
//!
//! Every drive payload shares one cache namespace, so one store bounds them
//! all; [`DrivePayload`] carries the different shapes through it.

use std::sync::Arc;

use futures::future::{join_all, try_join, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::ApiClient;
use crate::cache::{BackgroundUpdate, CacheKey, FetchOptions, FetchOutcome, Orchestrator, OrchestratorStats};
use crate::error::{FetchError, FetchResult};

pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Cache namespace for every drive key.
pub const DRIVE_NAMESPACE: &str = "drive";

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Upper bound on pages followed for one listing.
const MAX_PAGES: usize = 10;

const PAGE_SIZE: &str = "100";

const FILE_FIELDS: &str = "files(id,name,mimeType,size,modifiedTime,thumbnailLink,webViewLink,webContentLink,imageMediaMetadata),nextPageToken";
const FOLDER_FIELDS: &str = "files(id,name,mimeType)";
const INFO_FIELDS: &str = "id,name,mimeType";
const METADATA_FIELDS: &str = "id,name,mimeType,size,modifiedTime,createdTime,thumbnailLink,webViewLink,webContentLink,imageMediaMetadata";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_view_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_content_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_media_metadata: Option<serde_json::Value>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub children: Vec<FolderNode>,
}

impl FolderNode {
    /// Number of folders in this tree, including the root.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(FolderNode::count).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DrivePayload {
    Files(Vec<DriveFile>),
    Folder(FolderNode),
    File(DriveFile),
}

/// A value that travels through the drive cache as one [`DrivePayload`] variant.
pub trait DriveData: Sized + Send + 'static {
    fn wrap(self) -> DrivePayload;
    fn unwrap_payload(payload: DrivePayload) -> Option<Self>;
}

impl DriveData for Vec<DriveFile> {
    fn wrap(self) -> DrivePayload {
        DrivePayload::Files(self)
    }

    fn unwrap_payload(payload: DrivePayload) -> Option<Self> {
        match payload {
            DrivePayload::Files(files) => Some(files),
            _ => None,
        }
    }
}

impl DriveData for FolderNode {
    fn wrap(self) -> DrivePayload {
        DrivePayload::Folder(self)
    }

    fn unwrap_payload(payload: DrivePayload) -> Option<Self> {
        match payload {
            DrivePayload::Folder(folder) => Some(folder),
            _ => None,
        }
    }
}

impl DriveData for DriveFile {
    fn wrap(self) -> DrivePayload {
        DrivePayload::File(self)
    }

    fn unwrap_payload(payload: DrivePayload) -> Option<Self> {
        match payload {
            DrivePayload::File(file) => Some(file),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

fn drive_key<P: Serialize + ?Sized>(params: &P) -> FetchResult<CacheKey> {
    CacheKey::new(DRIVE_NAMESPACE, params)
        .map_err(|e| FetchError::Internal(format!("Failed to build cache key: {}", e)))
}

/// Key kinds whose second parameter is a folder id.
const FOLDER_KEY_KINDS: [&str; 4] = ["files", "folders", "images", "structure"];

/// A Drive query string literal, with `\` and `'` escaped.
fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn in_parents(folder_id: &str) -> String {
    format!("{} in parents and trashed=false", quote_literal(folder_id))
}

/// Whether a full drive cache key holds data listed under `folder_id`.
fn keyed_to_folder(key: &str, folder_id: &str) -> bool {
    let prefix = CacheKey::namespace_prefix(DRIVE_NAMESPACE);
    let Some(id) = key.strip_prefix(&prefix) else {
        return false;
    };
    let Ok(params) = serde_json::from_str::<Vec<serde_json::Value>>(id) else {
        return false;
    };
    let kind = params.first().and_then(serde_json::Value::as_str);
    let folder = params.get(1).and_then(serde_json::Value::as_str);
    matches!(kind, Some(k) if FOLDER_KEY_KINDS.contains(&k)) && folder == Some(folder_id)
}

/// Every file in a folder, following `nextPageToken` up to [`MAX_PAGES`].
async fn list_all(client: &ApiClient, folder_id: &str, mime_type: Option<&str>) -> FetchResult<Vec<DriveFile>> {
    let mut query = in_parents(folder_id);
    if let Some(mime) = mime_type {
        query.push_str(&format!(" and mimeType={}", quote_literal(mime)));
    }

    let mut files = Vec::new();
    let mut page_token: Option<String> = None;
    for page in 1..=MAX_PAGES {
        let mut params = vec![
            ("q", query.as_str()),
            ("pageSize", PAGE_SIZE),
            ("orderBy", "name"),
            ("fields", FILE_FIELDS),
        ];
        if let Some(token) = page_token.as_deref() {
            params.push(("pageToken", token));
        }
        let url = client.url(&["files"], &params)?;
        let list: FileList = client.get_json(url).await?;
        files.extend(list.files);

        match list.next_page_token {
            Some(token) if page < MAX_PAGES => page_token = Some(token),
            Some(_) => {
                debug!(folder = folder_id, pages = page, "Page limit reached, listing truncated");
                break;
            }
            None => break,
        }
    }
    Ok(files)
}

async fn list_subfolders(client: &ApiClient, folder_id: &str) -> FetchResult<Vec<DriveFile>> {
    let query = format!(
        "{} in parents and mimeType='{}' and trashed=false",
        quote_literal(folder_id),
        FOLDER_MIME_TYPE
    );
    let url = client.url(
        &["files"],
        &[
            ("q", query.as_str()),
            ("pageSize", PAGE_SIZE),
            ("orderBy", "name"),
            ("fields", FOLDER_FIELDS),
        ],
    )?;
    let list: FileList = client.get_json(url).await?;
    Ok(list.files)
}

/// Folder info and subfolders concurrently, then every child subtree
/// concurrently. A child that fails is left out rather than failing the tree.
fn build_tree(
    client: Arc<ApiClient>,
    folder_id: String,
    max_depth: usize,
    depth: usize,
) -> BoxFuture<'static, FetchResult<FolderNode>> {
    async move {
        let info = async {
            let url = client.url(&["files", folder_id.as_str()], &[("fields", INFO_FIELDS)])?;
            client.get_json::<DriveFile>(url).await
        };
        let subfolders = async {
            if depth < max_depth {
                list_subfolders(&client, &folder_id).await
            } else {
                Ok(Vec::new())
            }
        };
        let (info, subfolders) = try_join(info, subfolders).await?;

        let mut subtrees = Vec::with_capacity(subfolders.len());
        for sub in subfolders {
            subtrees.push(build_tree(Arc::clone(&client), sub.id, max_depth, depth + 1));
        }
        let mut children = Vec::new();
        for result in join_all(subtrees).await {
            match result {
                Ok(child) => children.push(child),
                Err(e) => debug!(parent = %folder_id, error = %e, "Skipping unreadable subfolder"),
            }
        }

        Ok(FolderNode {
            id: info.id,
            name: info.name,
            mime_type: info.mime_type,
            children,
        })
    }
    .boxed()
}

#[derive(Clone)]
pub struct DriveService {
    client: Arc<ApiClient>,
    orchestrator: Orchestrator<DrivePayload>,
}

impl DriveService {
    pub fn new(client: ApiClient, orchestrator: Orchestrator<DrivePayload>) -> Self {
        Self {
            client: Arc::new(client),
            orchestrator,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    pub fn orchestrator(&self) -> &Orchestrator<DrivePayload> {
        &self.orchestrator
    }

    fn ensure_configured(&self) -> FetchResult<()> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(FetchError::Configuration(
                "Drive API key is not configured".to_string(),
            ))
        }
    }

    /// Run one typed fetch through the shared drive orchestrator.
    async fn fetch<T, F, Fut>(
        &self,
        key: CacheKey,
        producer: F,
        options: FetchOptions<T>,
    ) -> FetchResult<FetchOutcome<T>>
    where
        T: DriveData,
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = FetchResult<T>> + Send + 'static,
    {
        let on_update = options.on_background_update.map(|callback| {
            Box::new(move |payload: DrivePayload| {
                if let Some(data) = T::unwrap_payload(payload) {
                    callback(data);
                }
            }) as BackgroundUpdate<DrivePayload>
        });
        let options = FetchOptions {
            force_refresh: options.force_refresh,
            on_background_update: on_update,
        };

        let outcome = self
            .orchestrator
            .fetch_with(&key, move || producer().map(|r| r.map(T::wrap)), options)
            .await?;
        let source = outcome.source;
        match T::unwrap_payload(outcome.data) {
            Some(data) => Ok(FetchOutcome { data, source }),
            None => Err(FetchError::Internal(format!(
                "Cached payload for {} has an unexpected shape",
                key
            ))),
        }
    }

    pub async fn list_files(
        &self,
        folder_id: &str,
        mime_type: Option<&str>,
        options: FetchOptions<Vec<DriveFile>>,
    ) -> FetchResult<FetchOutcome<Vec<DriveFile>>> {
        self.ensure_configured()?;
        let key = drive_key(&("files", folder_id, mime_type.unwrap_or("all")))?;
        let client = Arc::clone(&self.client);
        let folder = folder_id.to_string();
        let mime = mime_type.map(str::to_string);
        self.fetch(
            key,
            move || async move { list_all(&client, &folder, mime.as_deref()).await },
            options,
        )
        .await
    }

    pub async fn folder_structure(
        &self,
        folder_id: &str,
        max_depth: usize,
        options: FetchOptions<FolderNode>,
    ) -> FetchResult<FetchOutcome<FolderNode>> {
        self.ensure_configured()?;
        let key = drive_key(&("structure", folder_id, max_depth))?;
        let client = Arc::clone(&self.client);
        let folder = folder_id.to_string();
        self.fetch(key, move || build_tree(client, folder, max_depth, 0), options)
            .await
    }

    /// Image files in a folder, newest first.
    pub async fn images(
        &self,
        folder_id: &str,
        options: FetchOptions<Vec<DriveFile>>,
    ) -> FetchResult<FetchOutcome<Vec<DriveFile>>> {
        self.ensure_configured()?;
        let key = drive_key(&("images", folder_id))?;
        let client = Arc::clone(&self.client);
        let query = format!("{} and (mimeType contains 'image/')", in_parents(folder_id));
        self.fetch(
            key,
            move || async move {
                let url = client.url(
                    &["files"],
                    &[
                        ("q", query.as_str()),
                        ("pageSize", PAGE_SIZE),
                        ("orderBy", "modifiedTime desc"),
                        ("fields", FILE_FIELDS),
                    ],
                )?;
                let list: FileList = client.get_json(url).await?;
                Ok(list.files)
            },
            options,
        )
        .await
    }

    pub async fn subfolders(
        &self,
        folder_id: &str,
        options: FetchOptions<Vec<DriveFile>>,
    ) -> FetchResult<FetchOutcome<Vec<DriveFile>>> {
        self.ensure_configured()?;
        let key = drive_key(&("folders", folder_id))?;
        let client = Arc::clone(&self.client);
        let folder = folder_id.to_string();
        self.fetch(
            key,
            move || async move { list_subfolders(&client, &folder).await },
            options,
        )
        .await
    }

    pub async fn file_metadata(
        &self,
        file_id: &str,
        force_refresh: bool,
    ) -> FetchResult<FetchOutcome<DriveFile>> {
        self.ensure_configured()?;
        let key = drive_key(&("metadata", file_id))?;
        let client = Arc::clone(&self.client);
        let file = file_id.to_string();
        let options = FetchOptions {
            force_refresh,
            on_background_update: None,
        };
        self.fetch(
            key,
            move || async move {
                let url = client.url(&["files", file.as_str()], &[("fields", METADATA_FIELDS)])?;
                client.get_json::<DriveFile>(url).await
            },
            options,
        )
        .await
    }

    /// Warm a folder's listing and subfolders in the background.
    pub fn prefetch_folder(&self, folder_id: &str) {
        if !self.is_configured() {
            return;
        }
        debug!(folder = folder_id, "Prefetching folder");
        let service = self.clone();
        let folder = folder_id.to_string();
        self.orchestrator.background().spawn(async move {
            let (files, folders) = futures::join!(
                service.list_files(&folder, None, FetchOptions::default()),
                service.subfolders(&folder, FetchOptions::default()),
            );
            if files.is_err() || folders.is_err() {
                debug!(folder = %folder, "Folder prefetch incomplete");
            }
        });
    }

    /// Drop one folder's cached listings and trees, or the whole drive
    /// namespace. File metadata is kept.
    pub fn invalidate(&self, folder_id: Option<&str>) {
        match folder_id {
            Some(folder) => {
                let cleared = self
                    .orchestrator
                    .invalidate_matching(|key| keyed_to_folder(key, folder));
                debug!(folder = folder, cleared = cleared, "Drive cache invalidated for folder");
            }
            None => {
                let cleared = self.orchestrator.invalidate_namespace(DRIVE_NAMESPACE);
                debug!(cleared = cleared, "All drive cache cleared");
            }
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.orchestrator.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, FetchSource, PersistentStore, FILES_NAMESPACE};
    use crate::clock::ManualClock;
    use crate::config::NamespaceConfig;
    use crate::http::testing::ScriptedTransport;
    use serde_json::json;

    const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";

    struct Fixture {
        service: DriveService,
        transport: ScriptedTransport,
        clock: ManualClock,
        _dir: tempfile::TempDir,
    }

    fn fixture(key: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = ScriptedTransport::new();
        let clock = ManualClock::default();
        let persistent = Arc::new(PersistentStore::new(dir.path().to_path_buf()));
        let client = ApiClient::new(Arc::new(transport.clone()), DRIVE_API_BASE, key).unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(CacheStore::with_clock(
                NamespaceConfig::hierarchical(),
                Arc::new(clock.clone()),
            )),
            Some(persistent),
            FILES_NAMESPACE,
        );
        Fixture {
            service: DriveService::new(client, orchestrator),
            transport,
            clock,
            _dir: dir,
        }
    }

    fn file(id: &str, mime: &str) -> serde_json::Value {
        json!({"id": id, "name": format!("{}.dat", id), "mimeType": mime})
    }

    #[tokio::test]
    async fn test_list_files_follows_pages() {
        let f = fixture(Some("k"));
        f.transport.route_json(
            FILES_URL,
            json!({"files": [file("a", "text/plain")], "nextPageToken": "p2"}),
        );

        // Every page claims another follows; the listing stops at the cap
        let outcome = f.service.list_files("root", None, FetchOptions::default()).await.unwrap();
        assert_eq!(outcome.source, FetchSource::Network);
        assert_eq!(outcome.data.len(), MAX_PAGES);
        assert_eq!(f.transport.call_count(), MAX_PAGES);
        assert!(f.transport.calls()[1].contains("pageToken=p2"));
    }

    #[tokio::test]
    async fn test_list_files_single_page_then_cached() {
        let f = fixture(Some("k"));
        f.transport.route_json(
            FILES_URL,
            json!({"files": [file("a", "image/png"), file("b", FOLDER_MIME_TYPE)]}),
        );

        let first = f.service.list_files("root", None, FetchOptions::default()).await.unwrap();
        assert_eq!(first.data.len(), 2);
        assert!(first.data[0].is_image());
        assert!(first.data[1].is_folder());

        let second = f.service.list_files("root", None, FetchOptions::default()).await.unwrap();
        assert_eq!(second.source, FetchSource::CacheFresh);
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_folder_structure_skips_failed_children() {
        let f = fixture(Some("k"));
        f.transport.route_json(&format!("{}/root", FILES_URL), file("root", FOLDER_MIME_TYPE));
        f.transport.route_json(&format!("{}/child", FILES_URL), file("child", FOLDER_MIME_TYPE));
        f.transport.route(
            &format!("{}/broken", FILES_URL),
            crate::http::HttpResponse::new(500, "boom"),
        );
        // Subfolder listings: root has two children, child has none
        f.transport.route_json(
            &format!("{}?key=k&q=%27root%27", FILES_URL),
            json!({"files": [file("child", FOLDER_MIME_TYPE), file("broken", FOLDER_MIME_TYPE)]}),
        );
        f.transport.route_json(&format!("{}?key=k&q=%27child%27", FILES_URL), json!({"files": []}));

        let outcome = f
            .service
            .folder_structure("root", 2, FetchOptions::default())
            .await
            .unwrap();
        let tree = outcome.data;
        assert_eq!(tree.id, "root");
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].id, "child");
        assert_eq!(tree.count(), 2);
    }

    #[tokio::test]
    async fn test_folder_structure_root_failure_propagates() {
        let f = fixture(Some("k"));
        f.transport.route(
            &format!("{}/root", FILES_URL),
            crate::http::HttpResponse::new(404, r#"{"error": {"message": "File not found"}}"#),
        );
        let result = f.service.folder_structure("root", 0, FetchOptions::default()).await;
        assert!(matches!(result, Err(FetchError::Upstream { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_unconfigured_fails_fast() {
        let f = fixture(None);
        let result = f.service.images("root", FetchOptions::default()).await;
        assert!(matches!(result, Err(FetchError::Configuration(_))));
        f.service.prefetch_folder("root");
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_payload_kinds_share_one_namespace() {
        let f = fixture(Some("k"));
        f.transport.route_json(FILES_URL, json!({"files": [file("a", "image/png")]}));
        f.transport.route_json(&format!("{}/a", FILES_URL), file("a", "image/png"));

        f.service.images("root", FetchOptions::default()).await.unwrap();
        f.service.subfolders("root", FetchOptions::default()).await.unwrap();
        let meta = f.service.file_metadata("a", false).await.unwrap();
        assert_eq!(meta.data.id, "a");
        assert_eq!(f.service.stats().cache.total, 3);

        f.service.invalidate(Some("root"));
        assert_eq!(f.service.stats().cache.total, 1);
        f.service.invalidate(None);
        assert_eq!(f.service.stats().cache.total, 0);
    }

    #[tokio::test]
    async fn test_prefetch_folder_warms_cache() {
        let f = fixture(Some("k"));
        f.transport.route_json(FILES_URL, json!({"files": []}));

        f.service.prefetch_folder("root");
        f.service.orchestrator().settle().await;
        assert_eq!(f.service.stats().cache.total, 2);

        let listed = f.service.list_files("root", None, FetchOptions::default()).await.unwrap();
        assert_eq!(listed.source, FetchSource::CacheFresh);
    }

    #[tokio::test]
    async fn test_background_update_is_typed() {
        let f = fixture(Some("k"));
        f.transport.route_json(FILES_URL, json!({"files": [file("a", "text/plain")]}));
        f.service.list_files("root", None, FetchOptions::default()).await.unwrap();

        f.clock.advance_ms(400_000);
        f.transport.route_json(
            FILES_URL,
            json!({"files": [file("a", "text/plain"), file("b", "text/plain")]}),
        );
        let seen = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&seen);
        let options = FetchOptions::default().on_update(move |files: Vec<DriveFile>| {
            *slot.lock().unwrap() = Some(files.len());
        });

        let stale = f.service.list_files("root", None, options).await.unwrap();
        assert_eq!(stale.source, FetchSource::CacheStale);
        assert_eq!(stale.data.len(), 1);

        f.service.orchestrator().settle().await;
        assert_eq!(*seen.lock().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_invalidate_folder_drops_every_listing_kind() {
        let f = fixture(Some("k"));
        f.transport.route_json(FILES_URL, json!({"files": []}));
        f.transport.route_json(&format!("{}/root", FILES_URL), file("root", FOLDER_MIME_TYPE));

        let s = &f.service;
        s.list_files("root", None, FetchOptions::default()).await.unwrap();
        s.list_files("root", Some("image/png"), FetchOptions::default()).await.unwrap();
        s.images("root", FetchOptions::default()).await.unwrap();
        s.subfolders("root", FetchOptions::default()).await.unwrap();
        s.folder_structure("root", 0, FetchOptions::default()).await.unwrap();
        s.list_files("other", None, FetchOptions::default()).await.unwrap();
        f.service.file_metadata("root", false).await.unwrap();
        assert_eq!(f.service.stats().cache.total, 7);

        f.service.invalidate(Some("root"));
        assert_eq!(f.service.stats().cache.total, 2);

        let other = s.list_files("other", None, FetchOptions::default()).await.unwrap();
        assert_eq!(other.source, FetchSource::CacheFresh);
        let meta = f.service.file_metadata("root", false).await.unwrap();
        assert_eq!(meta.source, FetchSource::CacheFresh);
    }

    #[tokio::test]
    async fn test_folder_id_is_escaped_in_queries() {
        let f = fixture(Some("k"));
        f.transport.route_json(FILES_URL, json!({"files": []}));

        f.service
            .list_files("it's", Some("text/plain"), FetchOptions::default())
            .await
            .unwrap();
        f.service.subfolders("a\\b", FetchOptions::default()).await.unwrap();

        let calls = f.transport.calls();
        assert!(calls[0].contains("q=%27it%5C%27s%27+in+parents"), "{}", calls[0]);
        assert!(calls[0].contains("mimeType%3D%27text%2Fplain%27"), "{}", calls[0]);
        assert!(calls[1].contains("q=%27a%5C%5Cb%27+in+parents"), "{}", calls[1]);
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("root"), "'root'");
        assert_eq!(quote_literal("it's"), "'it\\'s'");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
        assert!(keyed_to_folder(r#"drive:["structure","root",2]"#, "root"));
        assert!(!keyed_to_folder(r#"drive:["metadata","root"]"#, "root"));
        assert!(!keyed_to_folder(r#"drive:["files","rootish","all"]"#, "root"));
    }

    #[test]
    fn test_payload_wire_shape() {
        let payload = Vec::<DriveFile>::new().wrap();
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"kind": "files", "data": []})
        );
        assert!(FolderNode::unwrap_payload(payload).is_none());
    }
}
