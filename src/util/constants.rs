//! # constants.rs
//!
//! Static constants and lazily-initialized paths used throughout the
//! supervisor: default port and naming, the instance directory layout,
//! media types accepted for file mounts, and the process-wide deployment
//! table.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::model::deployment::Deployment;

/// Port the HTTP server listens on unless `FLASK_PORT` overrides it.
pub const DEFAULT_PORT: u16 = 8080;

/// URL scheme used when building result and output URLs.
pub const DEFAULT_URL_SCHEME: &str = "http";

/// Device name reported to the orchestrator and the logging sidecar when
/// `SUPERVISOR_NAME` is not set.
pub const SUPERVISOR_DEFAULT_NAME: &str = "supervisor";

/// Path on the orchestrator where this device registers itself.
pub const ORCHESTRATOR_REGISTER_PATH: &str = "/file/device/discovery/register";

/// Folder name for fetched module binaries under the instance path.
pub const MODULE_FOLDER_NAME: &str = "wasm-modules";

/// Folder name for mounted files under the instance path.
pub const PARAMS_FOLDER_NAME: &str = "wasm-params";

/// Folder name for persisted deployment descriptors under the instance path.
pub const DEPLOYMENTS_FOLDER_NAME: &str = "deployments";

/// Suffix appended to a module's source path for its compiled-module cache.
pub const SERIALIZED_MODULE_SUFFIX: &str = ".SERIALIZED.wasm";

/// Name of the linear-memory export every module is expected to provide.
pub const MEMORY_EXPORT_NAME: &str = "memory";

/// Name of the allocator export used by host functions that hand dynamically
/// sized buffers to a module.
pub const ALLOC_EXPORT_NAME: &str = "alloc";

/// Timeout for a chained sub-call to the next endpoint.
pub const SUB_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for POSTs made on behalf of a module through the `rpcCall` import.
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Media types accepted for file-based inputs and outputs.
///
/// Used during mount setup and when interpreting an endpoint's response.
pub const FILE_TYPES: [&str; 7] = [
    "image/png",
    "image/jpeg",
    "image/jpg",
    "application/octet-stream",
    "application/wasm",
    "text/html",
    "text/javascript",
];

/// Host imports advertised to the orchestrator in the device description.
pub const SUPERVISOR_INTERFACES: [&str; 2] = ["takeImageDynamicSize", "takeImageStaticSize"];

/// Root path for everything this instance of the service stores on disk.
///
/// Configured via the `INSTANCE_PATH` environment variable, defaulting to
/// `./instance`.
pub static INSTANCE_PATH: Lazy<PathBuf> = Lazy::new(|| {
    PathBuf::from(std::env::var("INSTANCE_PATH").unwrap_or_else(|_| "./instance".into()))
});

/// Directory containing fetched module binaries.
pub static MODULE_FOLDER: Lazy<PathBuf> = Lazy::new(|| INSTANCE_PATH.join(MODULE_FOLDER_NAME));

/// Directory containing the per-module mount roots.
pub static PARAMS_FOLDER: Lazy<PathBuf> = Lazy::new(|| INSTANCE_PATH.join(PARAMS_FOLDER_NAME));

/// Directory containing persisted deployment descriptors.
pub static DEPLOYMENTS_FOLDER: Lazy<PathBuf> =
    Lazy::new(|| INSTANCE_PATH.join(DEPLOYMENTS_FOLDER_NAME));

/// Active deployments by deployment id.
pub static DEPLOYMENTS: Lazy<Mutex<HashMap<String, Deployment>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Ensures that all required instance directories exist.
///
/// Must run in main before anything else touches the instance path.
pub fn ensure_required_folders() {
    fs::create_dir_all(&*MODULE_FOLDER).expect("Failed to create module folder");
    fs::create_dir_all(&*PARAMS_FOLDER).expect("Failed to create params folder");
    fs::create_dir_all(&*DEPLOYMENTS_FOLDER).expect("Failed to create deployments folder");
}
