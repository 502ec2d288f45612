//! Device-facing endpoints: descriptions, health and orchestrator
//! registration.

use actix_web::{HttpResponse, Responder};
use log::{error, info};
use serde_json::json;

use crate::util::configuration::{get_device_description, get_health_report, get_wot_td};
use crate::util::constants::{ORCHESTRATOR_REGISTER_PATH, SUPERVISOR_DEFAULT_NAME};
use crate::util::paths::server_address;

/// Device description containing platform info and supervisor interfaces.
pub async fn wasmiot_device_description() -> impl Responder {
    info!("Device description request served");
    HttpResponse::Ok().json(get_device_description())
}

/// The static Web of Things Thing Description.
pub async fn thingi_description() -> impl Responder {
    match get_wot_td() {
        Ok(description) => HttpResponse::Ok().json(description),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "status": "error",
            "result": format!("no thing description available: {}", e),
        })),
    }
}

/// Liveness probe with current CPU and memory usage.
pub async fn thingi_health() -> impl Responder {
    HttpResponse::Ok().json(get_health_report())
}

/// Announce this device to the orchestrator named by `ORCHESTRATOR_URL`.
///
/// Fire-and-forget at startup; a failure is logged and the supervisor keeps
/// serving regardless.
pub async fn register_with_orchestrator(orchestrator_url: String) {
    let (_, host, port) = server_address();
    let name = std::env::var("SUPERVISOR_NAME")
        .unwrap_or_else(|_| SUPERVISOR_DEFAULT_NAME.to_string());
    let body = json!({
        "name": name,
        "host": host.clone(),
        "port": port,
        "addresses": [host],
        "properties": { "path": "/", "tls": "0" },
    });

    let url = format!(
        "{}{}",
        orchestrator_url.trim_end_matches('/'),
        ORCHESTRATOR_REGISTER_PATH
    );
    match reqwest::Client::new().post(&url).json(&body).send().await {
        Ok(response) if response.status().is_success() => {
            info!("Registered with orchestrator at {}", url);
        }
        Ok(response) => {
            error!(
                "Orchestrator registration at {} returned {}",
                url,
                response.status()
            );
        }
        Err(e) => error!("Orchestrator registration at {} failed: {}", url, e),
    }
}
