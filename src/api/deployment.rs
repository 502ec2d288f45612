//! Deployment lifecycle endpoints: create, list and delete.

use std::collections::HashMap;
use std::path::Path;

use actix_web::{web, HttpResponse, Responder};
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::FetchFailures;
use crate::function_name;
use crate::model::deployment::{Deployment, InstructionsDoc, ModuleEndpointMap, ModuleMountMap};
use crate::model::module::ModuleConfig;
use crate::util::constants::{DEPLOYMENTS, PARAMS_FOLDER};
use crate::util::logging::spawn_log;
use crate::util::paths::{
    deployment_json_path, module_binary_path, module_mount_path, save_deployment_to_disk,
};

/// One module of the deployment manifest: identity plus where to fetch its
/// binary and data files from.
#[derive(Debug, Deserialize)]
pub struct ModuleSpec {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub urls: ModuleUrls,
}

#[derive(Debug, Deserialize)]
pub struct ModuleUrls {
    pub binary: String,
    #[serde(default)]
    pub other: HashMap<String, String>,
}

/// The manifest the orchestrator POSTs to `/deploy`.
#[derive(Debug, Deserialize)]
pub struct DeploymentManifest {
    #[serde(rename = "deploymentId")]
    pub deployment_id: String,
    pub modules: Vec<ModuleSpec>,
    #[serde(default)]
    pub endpoints: ModuleEndpointMap,
    #[serde(default)]
    pub instructions: InstructionsDoc,
    #[serde(default)]
    pub mounts: ModuleMountMap,
}

/// Create a deployment: fetch all referenced artifacts, validate the graph,
/// set up one isolated runtime per module and remember the result.
///
/// Fetch failures are collected across all modules and reported together;
/// nothing is recorded and no runtimes are created in that case. Artifacts
/// already written before the failure stay on disk.
pub async fn deployment_create(payload: web::Json<Value>) -> impl Responder {
    spawn_log(
        "INFO",
        "Deployment creation request received".to_string(),
        function_name!().to_string(),
    );

    let manifest: DeploymentManifest = match serde_json::from_value(payload.into_inner()) {
        Ok(manifest) => manifest,
        Err(e) => {
            return HttpResponse::BadRequest().json(json!({
                "status": "error",
                "errors": [format!("malformed deployment manifest: {}", e)],
            }));
        }
    };
    if manifest.modules.is_empty() {
        return HttpResponse::BadRequest().json(json!({
            "status": "error",
            "errors": ["no modules listed in deployment request"],
        }));
    }

    let module_configs = match fetch_modules(&manifest.modules).await {
        Ok(configs) => configs,
        Err(failures) => {
            error!(
                "Deployment '{}' failed: {} fetch failure(s)",
                manifest.deployment_id,
                failures.errors.len()
            );
            return HttpResponse::InternalServerError().json(json!({
                "status": "error",
                "errors": failures.errors,
            }));
        }
    };

    let mut deployment = match Deployment::from_parts(
        manifest.deployment_id.clone(),
        module_configs,
        manifest.endpoints,
        manifest.instructions,
        manifest.mounts,
        PARAMS_FOLDER.clone(),
    ) {
        Ok(deployment) => deployment,
        Err(e) => {
            return HttpResponse::BadRequest().json(json!({
                "status": "error",
                "errors": [e.to_string()],
            }));
        }
    };
    if let Err(e) = deployment.init_runtimes() {
        return HttpResponse::InternalServerError().json(json!({
            "status": "error",
            "errors": [e.to_string()],
        }));
    }

    if let Err(e) = save_deployment_to_disk(&deployment) {
        error!(
            "Failed to persist deployment '{}': {}",
            manifest.deployment_id, e
        );
    }

    DEPLOYMENTS
        .lock()
        .insert(manifest.deployment_id.clone(), deployment);

    info!("Deployment created: {}", manifest.deployment_id);
    spawn_log(
        "INFO",
        format!("Deployment created: {}", manifest.deployment_id),
        function_name!().to_string(),
    );
    HttpResponse::Ok().json(json!({ "status": "success" }))
}

/// List all active deployments. Runtimes are not part of the serialization.
pub async fn deployment_get() -> impl Responder {
    let deployments = DEPLOYMENTS.lock();
    let list: Vec<&Deployment> = deployments.values().collect();
    HttpResponse::Ok().json(json!({ "deployments": list }))
}

/// Forget a deployment. Fetched artifacts stay on disk; only the in-memory
/// graph and the persisted descriptor go away.
pub async fn deployment_delete(path: web::Path<String>) -> impl Responder {
    let deployment_id = path.into_inner();

    if DEPLOYMENTS.lock().remove(&deployment_id).is_none() {
        return HttpResponse::NotFound().json(json!({
            "status": "error",
            "result": "deployment does not exist",
            "deploymentId": deployment_id,
        }));
    }

    let json_path = deployment_json_path(&deployment_id);
    if json_path.exists() {
        if let Err(e) = std::fs::remove_file(&json_path) {
            error!(
                "Failed to delete persisted deployment {}: {}",
                json_path.display(),
                e
            );
        }
    }

    spawn_log(
        "INFO",
        format!("Deployment deleted: {}", deployment_id),
        function_name!().to_string(),
    );
    HttpResponse::Ok().json(json!({ "status": "success" }))
}

/// Fetch every module binary and data file of the manifest, saving them into
/// the instance layout. All failures are gathered before giving up.
async fn fetch_modules(modules: &[ModuleSpec]) -> Result<Vec<ModuleConfig>, FetchFailures> {
    let client = reqwest::Client::new();
    let mut configs = Vec::new();
    let mut errors = Vec::new();

    for spec in modules {
        let binary_path = module_binary_path(&spec.name);
        if let Err(e) = fetch_to_file(&client, &spec.urls.binary, &binary_path).await {
            errors.push(e);
        }

        let mut data_files = HashMap::new();
        for (name, url) in &spec.urls.other {
            let target = module_mount_path(&spec.name, name);
            match fetch_to_file(&client, url, &target).await {
                Ok(()) => {
                    data_files.insert(name.clone(), target);
                }
                Err(e) => errors.push(e),
            }
        }

        let mut config =
            ModuleConfig::new(spec.id.clone(), spec.name.clone(), binary_path, data_files);
        config.set_model_from_data_files();
        configs.push(config);
    }

    if errors.is_empty() {
        Ok(configs)
    } else {
        Err(FetchFailures { errors })
    }
}

/// GET one URL into the given path. The error value is the response object
/// reported back to the orchestrator.
async fn fetch_to_file(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
) -> Result<(), Value> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| json!({ "url": url, "error": e.to_string() }))?;
    if !response.status().is_success() {
        return Err(json!({ "url": url, "status": response.status().as_u16() }));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| json!({ "url": url, "error": e.to_string() }))?;

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| json!({ "url": url, "error": e.to_string() }))?;
    }
    std::fs::write(target, &bytes).map_err(|e| json!({ "url": url, "error": e.to_string() }))
}
