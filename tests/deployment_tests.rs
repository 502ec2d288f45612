//! Tests for the deployment graph: descriptor validation, argument
//! coercion, mount reconciliation and call chaining.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde_json::{json, Value};

use fabric_supervisor::error::{MountError, SupervisorError};
use fabric_supervisor::model::deployment::{
    parse_endpoint_result, CallData, Deployment, EndpointArgs, InstructionsDoc, ModuleEndpointMap,
    ModuleMountMap,
};
use fabric_supervisor::model::endpoint::Endpoint;
use fabric_supervisor::model::module::ModuleConfig;
use fabric_supervisor::model::mount::StageMounts;

const TEST_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add)
  (func (export "noargs") (result i32)
    i32.const 7))
"#;

fn endpoint(url: &str, path: &str, params: &[&str], response: Value) -> Endpoint {
    let parameters: Vec<Value> = params.iter().map(|name| json!({ "name": name })).collect();
    serde_json::from_value(json!({
        "url": url,
        "path": path,
        "method": "GET",
        "request": { "parameters": parameters },
        "response": response,
    }))
    .unwrap()
}

fn integer_response() -> Value {
    json!({ "media_type": "application/json", "schema": { "type": "integer" } })
}

fn jpeg_response() -> Value {
    json!({ "media_type": "image/jpeg", "schema": { "type": "string", "format": "binary" } })
}

fn stage_mounts(doc: Value) -> StageMounts {
    serde_json::from_value(doc).unwrap()
}

/// A one-module deployment around the test WebAssembly module.
fn test_deployment(
    dir: &tempfile::TempDir,
    function_name: &str,
    params: &[&str],
    response: Value,
    mounts_doc: Value,
    data_files: HashMap<String, PathBuf>,
) -> Deployment {
    let module_path = dir.path().join("module.wat");
    fs::write(&module_path, TEST_WAT).unwrap();

    let config = ModuleConfig::new("id-1".into(), "m".into(), module_path, data_files);

    let mut endpoints: ModuleEndpointMap = HashMap::new();
    endpoints.entry("m".into()).or_default().insert(
        function_name.into(),
        endpoint("http://localhost:8080", "/m/run", params, response),
    );

    let mut mounts: ModuleMountMap = HashMap::new();
    mounts
        .entry("m".into())
        .or_default()
        .insert(function_name.into(), stage_mounts(mounts_doc));

    let mut deployment = Deployment::from_parts(
        "d1".into(),
        vec![config],
        endpoints,
        InstructionsDoc::default(),
        mounts,
        dir.path().join("params"),
    )
    .expect("valid deployment");
    deployment.init_runtimes().expect("runtime setup");
    deployment
}

#[test]
fn referencing_an_unlisted_module_is_rejected() {
    let mut endpoints: ModuleEndpointMap = HashMap::new();
    endpoints.entry("ghost".into()).or_default().insert(
        "fn".into(),
        endpoint("http://localhost", "/x", &[], integer_response()),
    );

    let result = Deployment::from_parts(
        "d1".into(),
        Vec::new(),
        endpoints,
        InstructionsDoc::default(),
        HashMap::new(),
        PathBuf::from("/tmp/unused"),
    );
    assert!(matches!(result, Err(SupervisorError::Descriptor(_))));
}

#[test]
fn endpoint_functions_get_mount_entries_for_all_stages() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = test_deployment(
        &dir,
        "noargs",
        &[],
        integer_response(),
        json!({}),
        HashMap::new(),
    );
    let stages = &deployment.mounts["m"]["noargs"];
    assert!(stages.deployment.is_empty());
    assert!(stages.execution.is_empty());
    assert!(stages.output.is_empty());
}

#[test]
fn duplicate_mount_paths_within_a_stage_are_rejected() {
    let mut mounts = stage_mounts(json!({
        "execution": [
            { "path": "a.bin", "media_type": "application/octet-stream" },
            { "path": "a.bin", "media_type": "application/octet-stream" }
        ]
    }));
    assert!(matches!(
        mounts.normalize(),
        Err(SupervisorError::Descriptor(_))
    ));
}

#[test]
fn escaping_mount_paths_are_rejected() {
    for bad in ["../secret", "/etc/passwd", ""] {
        let mut mounts = stage_mounts(json!({
            "output": [{ "path": bad, "media_type": "image/jpeg" }]
        }));
        assert!(
            matches!(mounts.normalize(), Err(SupervisorError::Descriptor(_))),
            "path {:?} should be rejected",
            bad
        );
    }
}

#[test]
fn integer_response_becomes_json_scalar() {
    let response = serde_json::from_value(integer_response()).unwrap();
    let (args, files) = parse_endpoint_result(&json!(5), &response, &[]).unwrap();
    assert_eq!(args, Some(EndpointArgs::Scalar("5".into())));
    assert!(files.is_none());
}

#[test]
fn binary_response_requires_exactly_one_output_mount() {
    let response = serde_json::from_value(jpeg_response()).unwrap();
    let mounts = stage_mounts(json!({
        "output": [{ "path": "out.jpg", "media_type": "image/jpeg" }]
    }));

    let (args, files) = parse_endpoint_result(&Value::Null, &response, &mounts.output).unwrap();
    assert!(args.is_none());
    assert_eq!(files, Some(vec!["out.jpg".to_string()]));

    assert!(parse_endpoint_result(&Value::Null, &response, &[]).is_err());

    let two = stage_mounts(json!({
        "output": [
            { "path": "a.jpg", "media_type": "image/jpeg" },
            { "path": "b.jpg", "media_type": "image/jpeg" }
        ]
    }));
    assert!(parse_endpoint_result(&Value::Null, &response, &two.output).is_err());
}

#[test]
fn unknown_media_type_is_rejected() {
    let response =
        serde_json::from_value(json!({ "media_type": "application/x-matroska" })).unwrap();
    assert!(matches!(
        parse_endpoint_result(&Value::Null, &response, &[]),
        Err(SupervisorError::Descriptor(_))
    ));
}

#[test]
fn call_data_builds_query_from_scalar_args() {
    let target = endpoint("http://device2:8080/", "/d2/modules/m2/fn2", &["count"], integer_response());
    let call = CallData::from_endpoint(&target, Some(&EndpointArgs::Scalar("5".into())), None)
        .unwrap();
    assert_eq!(call.url, "http://device2:8080/d2/modules/m2/fn2?count=5");
    assert_eq!(call.method, "GET");
    assert!(call.files.is_empty());
}

#[test]
fn call_data_query_round_trips_for_ordered_args() {
    let target = endpoint("http://host", "/run", &["a", "b", "c"], integer_response());
    let values = vec!["1".to_string(), "2".to_string(), "3".to_string()];
    let call =
        CallData::from_endpoint(&target, Some(&EndpointArgs::Ordered(values.clone())), None)
            .unwrap();

    let query = call.url.split_once('?').map(|(_, q)| q).unwrap();
    let parsed: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap();
    let expected: Vec<(String, String)> = ["a", "b", "c"]
        .iter()
        .zip(values)
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    assert_eq!(parsed, expected);
}

#[test]
fn call_data_requires_every_declared_parameter_for_keyed_args() {
    let target = endpoint("http://host", "/run", &["a", "b"], integer_response());

    let mut complete = IndexMap::new();
    complete.insert("b".to_string(), "2".to_string());
    complete.insert("a".to_string(), "1".to_string());
    let call = CallData::from_endpoint(&target, Some(&EndpointArgs::Keyed(complete)), None)
        .unwrap();
    assert_eq!(call.url, "http://host/run?a=1&b=2");

    let mut partial = IndexMap::new();
    partial.insert("a".to_string(), "1".to_string());
    assert!(CallData::from_endpoint(&target, Some(&EndpointArgs::Keyed(partial)), None).is_err());
}

#[test]
fn call_data_without_args_has_no_query() {
    let target = endpoint("http://host", "/run", &[], jpeg_response());
    let files = vec!["out.jpg".to_string()];
    let call = CallData::from_endpoint(&target, None, Some(&files)).unwrap();
    assert_eq!(call.url, "http://host/run");
    assert_eq!(call.files, files);
}

#[test]
fn prepare_coerces_arguments_in_declaration_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut deployment = test_deployment(
        &dir,
        "add",
        &["a", "b"],
        integer_response(),
        json!({}),
        HashMap::new(),
    );

    let mut args = IndexMap::new();
    // Arrival order differs from declaration order on purpose.
    args.insert("b".to_string(), "3".to_string());
    args.insert("a".to_string(), "2".to_string());

    let wasm_args = deployment
        .prepare_for_running("m", "add", &args, &HashMap::new())
        .expect("prepare");
    assert_eq!(wasm_args.len(), 2);
    assert!(matches!(wasm_args[0], wasmtime::Val::I32(2)));
    assert!(matches!(wasm_args[1], wasmtime::Val::I32(3)));
}

#[test]
fn prepare_rejects_unparsable_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let mut deployment = test_deployment(
        &dir,
        "add",
        &["a", "b"],
        integer_response(),
        json!({}),
        HashMap::new(),
    );

    let mut args = IndexMap::new();
    args.insert("a".to_string(), "two".to_string());
    args.insert("b".to_string(), "3".to_string());
    assert!(matches!(
        deployment.prepare_for_running("m", "add", &args, &HashMap::new()),
        Err(SupervisorError::Invocation(_))
    ));
}

#[test]
fn prepare_fails_on_missing_required_input() {
    let dir = tempfile::tempdir().unwrap();
    let mut deployment = test_deployment(
        &dir,
        "noargs",
        &[],
        integer_response(),
        json!({
            "execution": [{ "path": "input.bin", "media_type": "application/octet-stream" }]
        }),
        HashMap::new(),
    );

    let result = deployment.prepare_for_running("m", "noargs", &IndexMap::new(), &HashMap::new());
    assert!(matches!(
        result,
        Err(SupervisorError::Mount(MountError::MissingInputFile(path))) if path == "input.bin"
    ));
}

#[test]
fn prepare_fails_on_undeclared_upload() {
    let dir = tempfile::tempdir().unwrap();
    let mut deployment = test_deployment(
        &dir,
        "noargs",
        &[],
        integer_response(),
        json!({}),
        HashMap::new(),
    );

    let staged = dir.path().join("rogue.bin");
    fs::write(&staged, b"rogue").unwrap();
    let mut files = HashMap::new();
    files.insert("rogue.bin".to_string(), staged.to_string_lossy().to_string());

    let result = deployment.prepare_for_running("m", "noargs", &IndexMap::new(), &files);
    assert!(matches!(
        result,
        Err(SupervisorError::Mount(MountError::UnexpectedInputFile(path))) if path == "rogue.bin"
    ));
}

#[test]
fn prepare_fails_when_upload_collides_with_deployment_file() {
    let dir = tempfile::tempdir().unwrap();
    let shared_source = dir.path().join("shared-src.bin");
    fs::write(&shared_source, b"deployed").unwrap();
    let mut data_files = HashMap::new();
    data_files.insert("shared.bin".to_string(), shared_source);

    let mut deployment = test_deployment(
        &dir,
        "noargs",
        &[],
        integer_response(),
        json!({
            "deployment": [{ "path": "shared.bin", "media_type": "application/octet-stream" }],
            "execution": [{ "path": "shared.bin", "media_type": "application/octet-stream" }]
        }),
        data_files,
    );

    let staged = dir.path().join("upload.bin");
    fs::write(&staged, b"uploaded").unwrap();
    let mut files = HashMap::new();
    files.insert(
        "shared.bin".to_string(),
        staged.to_string_lossy().to_string(),
    );

    let result = deployment.prepare_for_running("m", "noargs", &IndexMap::new(), &files);
    assert!(matches!(
        result,
        Err(SupervisorError::Mount(MountError::DuplicateMount(path))) if path == "shared.bin"
    ));
}

#[test]
fn prepare_copies_inputs_byte_equal_into_the_mount_root() {
    let dir = tempfile::tempdir().unwrap();
    let config_source = dir.path().join("cfg-src.json");
    fs::write(&config_source, b"{\"threshold\": 3}").unwrap();
    let mut data_files = HashMap::new();
    data_files.insert("cfg.json".to_string(), config_source.clone());

    let mut deployment = test_deployment(
        &dir,
        "noargs",
        &[],
        integer_response(),
        json!({
            "deployment": [{ "path": "cfg.json", "media_type": "application/octet-stream" }],
            "execution": [{ "path": "input.bin", "media_type": "application/octet-stream" }]
        }),
        data_files,
    );

    let staged = dir.path().join("staged-input.bin");
    fs::write(&staged, b"request bytes").unwrap();
    let mut files = HashMap::new();
    files.insert(
        "input.bin".to_string(),
        staged.to_string_lossy().to_string(),
    );

    deployment
        .prepare_for_running("m", "noargs", &IndexMap::new(), &files)
        .expect("prepare");

    let mount_root = dir.path().join("params").join("m");
    assert_eq!(
        fs::read(mount_root.join("input.bin")).unwrap(),
        fs::read(&staged).unwrap()
    );
    assert_eq!(
        fs::read(mount_root.join("cfg.json")).unwrap(),
        fs::read(&config_source).unwrap()
    );
}

#[test]
fn interpret_terminates_without_a_link() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = test_deployment(
        &dir,
        "add",
        &["a", "b"],
        integer_response(),
        json!({}),
        HashMap::new(),
    );

    let ((args, files), next_call) = deployment
        .interpret_call_from("m", "add", &json!(5))
        .expect("interpretation");
    assert_eq!(args, Some(EndpointArgs::Scalar("5".into())));
    assert!(files.is_none());
    assert!(next_call.is_none());
}

#[test]
fn interpret_builds_next_call_from_link() {
    let dir = tempfile::tempdir().unwrap();
    let module_path = dir.path().join("module.wat");
    fs::write(&module_path, TEST_WAT).unwrap();
    let config = ModuleConfig::new("id-1".into(), "m".into(), module_path, HashMap::new());

    let from = endpoint("http://localhost:8080", "/d1/modules/m/add", &["a", "b"], integer_response());
    let to = endpoint("http://device2:8080", "/d1/modules/m2/fn2", &["count"], integer_response());

    let mut endpoints: ModuleEndpointMap = HashMap::new();
    endpoints
        .entry("m".into())
        .or_default()
        .insert("add".into(), from.clone());

    let instructions: InstructionsDoc = serde_json::from_value(json!({
        "modules": { "m": { "add": {
            "from": serde_json::to_value(&from).unwrap(),
            "to": serde_json::to_value(&to).unwrap(),
        }}}
    }))
    .unwrap();

    let deployment = Deployment::from_parts(
        "d1".into(),
        vec![config],
        endpoints,
        instructions,
        HashMap::new(),
        dir.path().join("params"),
    )
    .expect("valid deployment");

    let (_, next_call) = deployment
        .interpret_call_from("m", "add", &json!(5))
        .expect("interpretation");
    let call = next_call.expect("link should produce a next call");
    assert_eq!(call.url, "http://device2:8080/d1/modules/m2/fn2?count=5");
    assert_eq!(call.method, "GET");
}
