//! Atlas entry: gate-station validation of visitor authorization QR codes
//!
//! Decodes compact, Ed25519-signed QR payloads and classifies them offline
//! against cached keys and revocations, falling back from (or syncing to) the
//! Atlas Platform backend when it is reachable.
//!
//! This lib exposes the decoder, the classifier and the station service.

pub mod error;
pub mod models;
pub mod qr;
pub mod verify;
// Local Sled store: access events, cached revocations, operators
pub mod storage;
pub mod auth;
pub mod backend;
pub mod entry;
pub mod config;
pub mod telemetry;
// REST API module: Axum HTTP handlers for the scanning UI
pub mod rest;

pub use error::{Error, Result};
pub use models::{AccessAction, AccessEvent, ParsedQr, QrPayload, ScanResult, SyncStatus};
pub use qr::{parse, UnparseableQr};
