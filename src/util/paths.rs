//! Path and URL helpers tying the instance directory layout together.
//!
//! Layout:
//! - `{instance}/wasm-modules/{module_name}` — fetched binary
//! - `{instance}/wasm-modules/{module_name}.SERIALIZED.wasm` — compiled cache
//! - `{instance}/wasm-params/{module_name}/{mount_path}` — mounted files,
//!   visible to the module as its root `.`
//! - `{instance}/deployments/{deployment_id}.json` — persisted descriptor

use std::fs::File;
use std::path::PathBuf;

use crate::model::deployment::Deployment;
use crate::util::constants::{
    DEFAULT_PORT, DEFAULT_URL_SCHEME, DEPLOYMENTS_FOLDER, MODULE_FOLDER, PARAMS_FOLDER,
};

/// Filesystem path of the given module's `.wasm` binary.
pub fn module_binary_path(module_name: &str) -> PathBuf {
    MODULE_FOLDER.join(module_name)
}

/// Host path of a file mounted into a module at `filename`.
pub fn module_mount_path(module_name: &str, filename: &str) -> PathBuf {
    PARAMS_FOLDER.join(module_name).join(filename)
}

/// Staging location for a file uploaded with a request, before mount
/// reconciliation copies it under the module's mount root.
pub fn upload_staging_path(filename: &str) -> PathBuf {
    PARAMS_FOLDER.join(filename)
}

/// Path of a deployment's persisted JSON descriptor.
pub fn deployment_json_path(deployment_id: &str) -> PathBuf {
    DEPLOYMENTS_FOLDER.join(format!("{}.json", deployment_id))
}

/// Serialize a deployment into the deployments folder.
pub fn save_deployment_to_disk(deployment: &Deployment) -> Result<(), String> {
    let path = deployment_json_path(&deployment.id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let file = File::create(&path)
        .map_err(|e| format!("Failed to create {}: {}", path.display(), e))?;
    serde_json::to_writer_pretty(file, deployment)
        .map_err(|e| format!("Failed to serialize deployment {}: {}", deployment.id, e))
}

/// The address this supervisor advertises in URLs it hands out.
///
/// Scheme from `DEFAULT_URL_SCHEME`, host from `SERVER_NAME` (falling back to
/// the local IP), port from `FLASK_PORT`.
pub fn server_address() -> (String, String, u16) {
    let scheme = std::env::var("DEFAULT_URL_SCHEME")
        .unwrap_or_else(|_| DEFAULT_URL_SCHEME.to_string());
    let host = std::env::var("SERVER_NAME").unwrap_or_else(|_| {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "localhost".to_string())
    });
    let port = std::env::var("FLASK_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    (scheme, host, port)
}

/// URL where the result of the given request can be polled.
pub fn make_result_url(request_id: &str) -> String {
    let (scheme, host, port) = server_address();
    format!("{}://{}:{}/request-history/{}", scheme, host, port, request_id)
}

/// URL where an output file written by a module can be fetched.
pub fn make_output_url(module_name: &str, filename: &str) -> String {
    let (scheme, host, port) = server_address();
    format!(
        "{}://{}:{}/module_results/{}/{}",
        scheme,
        host,
        port,
        urlencoding::encode(module_name),
        urlencoding::encode(filename)
    )
}
