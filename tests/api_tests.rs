//! Handler-level tests against the HTTP surface, using the actix test
//! utilities. These exercise the boundary behaviour of invocation and
//! history endpoints without a running server.

use std::collections::HashMap;

use actix_web::{test, web, App};
use indexmap::IndexMap;
use serde_json::{json, Value};

use fabric_supervisor::api::results::{request_history_entry, request_history_list};
use fabric_supervisor::api::run::run_module_function;
use fabric_supervisor::model::deployment::{Deployment, InstructionsDoc, ModuleEndpointMap};
use fabric_supervisor::model::module::ModuleConfig;
use fabric_supervisor::model::request::{RequestEntry, REQUEST_HISTORY};
use fabric_supervisor::util::constants::DEPLOYMENTS;

fn history_entry(deployment_id: &str, success: bool) -> RequestEntry {
    let mut entry = RequestEntry::new(
        deployment_id.into(),
        "m".into(),
        "f".into(),
        "GET".into(),
        IndexMap::new(),
        HashMap::new(),
    );
    entry.result = Some(if success {
        json!(5)
    } else {
        json!("invocation failed: boom")
    });
    entry.success = success;
    entry
}

/// Register a deployment with one module named `m` and no endpoints.
fn install_deployment(dir: &tempfile::TempDir, deployment_id: &str) {
    let module_path = dir.path().join("module.wat");
    std::fs::write(&module_path, "(module)").unwrap();
    let config = ModuleConfig::new("id".into(), "m".into(), module_path, HashMap::new());
    let deployment = Deployment::from_parts(
        deployment_id.into(),
        vec![config],
        ModuleEndpointMap::new(),
        InstructionsDoc::default(),
        HashMap::new(),
        dir.path().join("params"),
    )
    .unwrap();
    DEPLOYMENTS.lock().insert(deployment_id.into(), deployment);
}

#[actix_web::test]
async fn history_entry_status_reflects_success() {
    let ok_entry = history_entry("api-history-ok", true);
    let failed_entry = history_entry("api-history-fail", false);
    let ok_id = ok_entry.request_id.clone();
    let failed_id = failed_entry.request_id.clone();
    REQUEST_HISTORY.append(ok_entry);
    REQUEST_HISTORY.append(failed_entry);

    let app = test::init_service(
        App::new()
            .route(
                "/request-history/{request_id}",
                web::get().to(request_history_entry),
            )
            .route("/request-history", web::get().to(request_history_list)),
    )
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/request-history/{}", ok_id))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/request-history/{}", failed_id))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 500);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/request-history/no-such-id")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn full_history_lists_appended_entries() {
    let entry = history_entry("api-history-list", true);
    let id = entry.request_id.clone();
    REQUEST_HISTORY.append(entry);

    let app = test::init_service(
        App::new().route("/request-history", web::get().to(request_history_list)),
    )
    .await;
    let body: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get().uri("/request-history").to_request(),
    )
    .await;

    let listed = body
        .as_array()
        .expect("history is a list")
        .iter()
        .any(|entry| entry["request_id"] == json!(id));
    assert!(listed);
}

#[actix_web::test]
async fn invoking_an_unknown_deployment_is_404() {
    let app = test::init_service(App::new().route(
        "/{deployment_id}/modules/{module_name}/{function_name}",
        web::get().to(run_module_function),
    ))
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/no-such-deployment/modules/m/f")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn invoking_an_unknown_module_is_400() {
    let dir = tempfile::tempdir().unwrap();
    install_deployment(&dir, "api-mod-check");

    let app = test::init_service(App::new().route(
        "/{deployment_id}/modules/{module_name}/{function_name}",
        web::get().to(run_module_function),
    ))
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api-mod-check/modules/ghost/f")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn failed_get_invocation_lands_in_history_as_500() {
    let dir = tempfile::tempdir().unwrap();
    install_deployment(&dir, "api-get-fail");

    let app = test::init_service(
        App::new()
            .route(
                "/{deployment_id}/modules/{module_name}/{function_name}",
                web::get().to(run_module_function),
            )
            .route(
                "/request-history/{request_id}",
                web::get().to(request_history_entry),
            ),
    )
    .await;

    // No endpoint is declared for the function, so the synchronous run fails
    // but still answers with a result link.
    let body: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get()
            .uri("/api-get-fail/modules/m/missing_fn")
            .to_request(),
    )
    .await;
    let result_url = body["resultUrl"].as_str().expect("resultUrl in response");
    let request_id = result_url.rsplit('/').next().unwrap();

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/request-history/{}", request_id))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 500);
}
