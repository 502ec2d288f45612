//! Result endpoints: request history and output files written by modules.

use actix_files::NamedFile;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde_json::json;

use crate::model::request::REQUEST_HISTORY;
use crate::util::paths::module_mount_path;

/// Serve a result file produced by a module execution.
pub async fn get_module_result(
    path: web::Path<(String, String)>,
    req: HttpRequest,
) -> impl Responder {
    let (module_name, filename) = path.into_inner();
    let file_path = module_mount_path(&module_name, &filename);
    match NamedFile::open(&file_path) {
        Ok(file) => file.into_response(&req),
        Err(_) => HttpResponse::NotFound().json(json!({
            "status": "error",
            "result": "module result file not found",
            "module": module_name,
            "filename": filename,
        })),
    }
}

/// The full request history.
pub async fn request_history_list() -> impl Responder {
    HttpResponse::Ok().json(REQUEST_HISTORY.snapshot())
}

/// One history entry by request id. Responds 200 for successful runs and 500
/// for failed ones, so pollers can tell the outcomes apart.
pub async fn request_history_entry(path: web::Path<String>) -> impl Responder {
    let request_id = path.into_inner();
    match REQUEST_HISTORY.find(&request_id) {
        Some(entry) if entry.success => HttpResponse::Ok().json(entry),
        Some(entry) => HttpResponse::InternalServerError().json(entry),
        None => HttpResponse::NotFound().json(json!({
            "status": "error",
            "result": "no matching entry in history",
            "requestId": request_id,
        })),
    }
}
