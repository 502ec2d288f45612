//! Invocation endpoints: run a module function and serve the files it
//! produced.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

use actix_files::NamedFile;
use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use indexmap::IndexMap;
use log::warn;
use serde_json::json;

use crate::exec::invoke::make_history;
use crate::exec::queue::WORK_QUEUE;
use crate::function_name;
use crate::model::request::RequestEntry;
use crate::util::constants::DEPLOYMENTS;
use crate::util::logging::spawn_log;
use crate::util::paths::{make_result_url, module_mount_path, upload_staging_path};

/// Execute a function in a module of a deployment.
///
/// Query parameters become the function's arguments; multipart body parts
/// become execution-stage mounts keyed by part name. GET requests run before
/// the response returns; POST requests are queued and return immediately.
/// Either way the response links to the entry in request history.
pub async fn run_module_function(
    path: web::Path<(String, String, String)>,
    req: HttpRequest,
    payload: web::Payload,
) -> impl Responder {
    let (deployment_id, module_name, function_name) = path.into_inner();

    // Existence checks plus the declared execution-stage mounts for upload
    // validation, under one short-lived lock.
    let execution_mounts: Vec<String> = {
        let deployments = DEPLOYMENTS.lock();
        let Some(deployment) = deployments.get(&deployment_id) else {
            return HttpResponse::NotFound().json(json!({
                "status": "error",
                "result": "deployment does not exist",
                "deploymentId": deployment_id,
            }));
        };
        if !deployment.modules.contains_key(&module_name) {
            return HttpResponse::BadRequest().json(json!({
                "status": "error",
                "result": format!("module {} not found for this deployment", module_name),
                "deploymentId": deployment_id,
            }));
        }
        deployment
            .mounts
            .get(&module_name)
            .and_then(|functions| functions.get(&function_name))
            .map(|stages| stages.execution.iter().map(|m| m.path.clone()).collect())
            .unwrap_or_default()
    };

    let query_str = req.uri().query().unwrap_or("");
    let request_args: IndexMap<String, String> =
        serde_urlencoded::from_str(query_str).unwrap_or_default();

    // Stage uploaded files before anything is enqueued. Undeclared parts
    // fail the request here, before an entry exists and before any bytes
    // land under the module's mount root.
    let mut request_files: HashMap<String, String> = HashMap::new();
    let mut staged_paths = Vec::new();
    if req.method() == actix_web::http::Method::POST {
        let mut multipart = Multipart::new(req.headers(), payload);
        while let Some(Ok(mut field)) = multipart.next().await {
            let content_disposition = field.content_disposition();
            let part_name = content_disposition.get_name().unwrap_or("file").to_string();
            let filename = content_disposition
                .get_filename()
                .map(sanitize_filename::sanitize)
                .unwrap_or_else(|| {
                    format!("{}_input.dat", sanitize_filename::sanitize(&part_name))
                });

            if !execution_mounts.contains(&part_name) {
                discard_staged(&staged_paths);
                return HttpResponse::BadRequest().json(json!({
                    "status": "error",
                    "result": format!("unexpected input file \"{}\"", part_name),
                }));
            }

            let save_path = upload_staging_path(&filename);
            if let Some(parent) = save_path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    discard_staged(&staged_paths);
                    return staging_failed(e.to_string());
                }
            }
            let mut file = match File::create(&save_path) {
                Ok(file) => file,
                Err(e) => {
                    discard_staged(&staged_paths);
                    return staging_failed(e.to_string());
                }
            };
            while let Some(chunk) = field.next().await {
                let write_result = chunk
                    .map_err(|e| e.to_string())
                    .and_then(|data| file.write_all(&data).map_err(|e| e.to_string()));
                if let Err(e) = write_result {
                    discard_staged(&staged_paths);
                    return staging_failed(e);
                }
            }

            staged_paths.push(save_path.clone());
            request_files.insert(part_name, save_path.to_string_lossy().to_string());
        }
    }

    let entry = RequestEntry::new(
        deployment_id.clone(),
        module_name.clone(),
        function_name.clone(),
        req.method().to_string(),
        request_args,
        request_files,
    );
    let result_url = make_result_url(&entry.request_id);

    spawn_log(
        "INFO",
        format!(
            "Executing module function: {}/{}/{}",
            deployment_id, module_name, function_name
        ),
        function_name!().to_string(),
    );

    if req.method() == actix_web::http::Method::GET {
        // Run on the blocking pool so WebAssembly execution never stalls the
        // reactor; the response waits for completion.
        if web::block(move || make_history(entry)).await.is_err() {
            return HttpResponse::InternalServerError().json(json!({
                "status": "error",
                "result": "execution task failed",
            }));
        }
    } else {
        let queued = WORK_QUEUE.get().map(|queue| queue.submit(entry));
        if queued != Some(true) {
            warn!("Work queue unavailable, dropping request");
            return HttpResponse::InternalServerError().json(json!({
                "status": "error",
                "result": "work queue unavailable",
            }));
        }
    }

    HttpResponse::Ok().json(json!({ "resultUrl": result_url }))
}

/// Serve a file staged or produced under the module's mount root.
pub async fn serve_module_file(
    path: web::Path<(String, String, String, String)>,
    req: HttpRequest,
) -> impl Responder {
    let (deployment_id, module_name, _function_name, filename) = path.into_inner();
    let file_path = module_mount_path(&module_name, &filename);
    match NamedFile::open(&file_path) {
        Ok(file) => file.into_response(&req),
        Err(_) => HttpResponse::NotFound().json(json!({
            "status": "error",
            "result": "file not found",
            "deploymentId": deployment_id,
            "module": module_name,
            "filename": filename,
        })),
    }
}

fn staging_failed(reason: String) -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({
        "status": "error",
        "result": format!("failed to stage upload: {}", reason),
    }))
}

fn discard_staged(paths: &[std::path::PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Could not remove staged upload {}: {}", path.display(), e);
        }
    }
}
