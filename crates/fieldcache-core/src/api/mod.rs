//! Data-access services for the two upstream APIs.
//!
//! Both APIs authenticate with a plain API key appended to the query
//! string. Each service owns one [`Orchestrator`](crate::cache::Orchestrator)
//! and validates its configuration before any cache or network work.

pub mod client;
pub mod drive;
pub mod sheets;

pub use client::ApiClient;
pub use drive::{DriveData, DriveFile, DrivePayload, DriveService, FolderNode, DRIVE_API_BASE, DRIVE_NAMESPACE, FOLDER_MIME_TYPE};
pub use sheets::{normalize_header, parse_values, SheetOutcome, SheetRow, SheetsService, SHEETS_API_BASE, SHEET_NAMESPACE};
