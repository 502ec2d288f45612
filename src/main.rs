//! # Supervisor entry point
//!
//! Startup tasks:
//! - Load `.env`, initialize logging and the instance directories
//! - Reload persisted deployments from disk
//! - Spawn the background worker that drains the WebAssembly work queue
//! - Register with the orchestrator when `ORCHESTRATOR_URL` is set
//! - Serve the HTTP surface until shutdown, then drain and join the worker

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use log::{error, info, warn};

use fabric_supervisor::api::deployment::{deployment_create, deployment_delete, deployment_get};
use fabric_supervisor::api::device::{
    register_with_orchestrator, thingi_description, thingi_health, wasmiot_device_description,
};
use fabric_supervisor::api::results::{
    get_module_result, request_history_entry, request_history_list,
};
use fabric_supervisor::api::run::{run_module_function, serve_module_file};
use fabric_supervisor::exec::invoke::make_history;
use fabric_supervisor::exec::queue::{WasmWorker, WORK_QUEUE};
use fabric_supervisor::model::deployment::Deployment;
use fabric_supervisor::util::constants::{self, DEPLOYMENTS, DEPLOYMENTS_FOLDER, PARAMS_FOLDER};
use fabric_supervisor::util::paths::server_address;
use fabric_supervisor::wasm::runtime::{selected_runtime, RuntimeKind};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    match dotenv::dotenv() {
        Ok(path) => println!("Loaded .env from {:?}", path),
        Err(err) => println!("Could not load .env file: {:?}", err),
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    constants::ensure_required_folders();

    if selected_runtime() == RuntimeKind::Wasm3 {
        warn!("WASM_RUNTIME=wasm3 requested but this build embeds only wasmtime; continuing with wasmtime");
    }

    load_saved_deployments();

    // Single consumer of the work queue; host-function state is only safe
    // with one invocation per runtime at a time.
    let worker = WasmWorker::spawn(|entry| {
        make_history(entry);
    });
    WORK_QUEUE
        .set(worker.queue())
        .unwrap_or_else(|_| warn!("Work queue was already installed"));

    if let Ok(orchestrator_url) = std::env::var("ORCHESTRATOR_URL") {
        tokio::spawn(register_with_orchestrator(orchestrator_url));
    }

    let (_, host, port) = server_address();
    let server = HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .wrap(actix_web::middleware::Logger::default())
            .service(
                web::resource("/.well-known/wasmiot-device-description")
                    .route(web::get().to(wasmiot_device_description)),
            )
            .service(
                web::resource("/.well-known/wot-thing-description")
                    .route(web::get().to(thingi_description)),
            )
            .service(web::resource("/health").route(web::get().to(thingi_health)))
            .service(
                web::resource("/module_results/{module_name}/{filename}")
                    .route(web::get().to(get_module_result)),
            )
            .service(
                web::resource("/request-history/{request_id}")
                    .route(web::get().to(request_history_entry)),
            )
            .service(
                web::resource("/request-history").route(web::get().to(request_history_list)),
            )
            .service(
                web::resource("/deploy/{deployment_id}")
                    .route(web::delete().to(deployment_delete)),
            )
            .service(
                web::resource("/deploy")
                    .route(web::get().to(deployment_get))
                    .route(web::post().to(deployment_create)),
            )
            .service(
                web::resource("/{deployment_id}/modules/{module_name}/{function_name}/{filename}")
                    .route(web::get().to(serve_module_file)),
            )
            .service(
                web::resource("/{deployment_id}/modules/{module_name}/{function_name}")
                    .route(web::get().to(run_module_function))
                    .route(web::post().to(run_module_function)),
            )
    })
    .bind(("0.0.0.0", port))?;

    info!("Starting supervisor service at http://{}:{}/", host, port);
    server.run().await?;

    // Drains queued work up to the shutdown sentinel before exiting.
    worker.shutdown();
    Ok(())
}

/// Bring persisted deployments back to life from the deployments folder.
fn load_saved_deployments() {
    let entries = match std::fs::read_dir(&*DEPLOYMENTS_FOLDER) {
        Ok(entries) => entries,
        Err(e) => {
            error!(
                "Could not read deployments folder {}: {}",
                DEPLOYMENTS_FOLDER.display(),
                e
            );
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                error!("Could not read {}: {}", path.display(), e);
                continue;
            }
        };
        let mut deployment: Deployment = match serde_json::from_str(&contents) {
            Ok(deployment) => deployment,
            Err(e) => {
                error!("Invalid deployment JSON in {}: {}", path.display(), e);
                continue;
            }
        };
        if let Err(e) = deployment.init(PARAMS_FOLDER.clone()) {
            error!(
                "Could not initialize runtimes for saved deployment '{}': {}",
                deployment.id, e
            );
            continue;
        }
        let id = deployment.id.clone();
        DEPLOYMENTS.lock().insert(id.clone(), deployment);
        info!("Loaded saved deployment '{}' from {}", id, path.display());
    }
}
