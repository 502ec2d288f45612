//! Execution of one request entry: prepare the module, run the function,
//! interpret its output and perform the chained sub-call when the deployment
//! declares one.
//!
//! Everything here is synchronous; it runs either on the worker thread or,
//! for GET requests, on a blocking-pool thread.

use log::{debug, error};
use serde_json::{json, Value};

use crate::error::SupervisorError;
use crate::function_name;
use crate::model::deployment::{CallData, EndpointArgs};
use crate::model::request::{RequestEntry, REQUEST_HISTORY};
use crate::util::constants::{DEPLOYMENTS, SUB_CALL_TIMEOUT};
use crate::util::logging::send_log;
use crate::util::paths::{make_output_url, module_mount_path};
use crate::wasm::runtime::val_to_json;

/// Execute an entry's work, record the outcome on the entry exactly once and
/// append it to the request history.
pub fn make_history(mut entry: RequestEntry) -> RequestEntry {
    match do_wasm_work(&mut entry) {
        Ok(result) => {
            entry.result = Some(result);
            entry.success = true;
        }
        Err(err) => {
            error!(
                "Error running WebAssembly function '{}': {}",
                entry.function_name, err
            );
            send_log(
                "ERROR",
                &format!("Error during Wasm execution: {}", err),
                function_name!(),
            );
            entry.result = Some(Value::String(err.to_string()));
            entry.success = false;
        }
    }

    REQUEST_HISTORY.append(entry.clone());
    entry
}

/// Run a WebAssembly function and follow the deployment's instructions on
/// what to do with its output.
///
/// Returns the sub-call's result reference when chaining is required, or the
/// interpreted output of this function otherwise.
fn do_wasm_work(entry: &mut RequestEntry) -> Result<Value, SupervisorError> {
    let ((next_args, next_files), next_call) = {
        let mut deployments = DEPLOYMENTS.lock();
        let deployment = deployments.get_mut(&entry.deployment_id).ok_or_else(|| {
            SupervisorError::Invocation(format!("deployment '{}' not found", entry.deployment_id))
        })?;

        debug!("Preparing Wasm module '{}'", entry.module_name);
        let wasm_args = deployment.prepare_for_running(
            &entry.module_name,
            &entry.function_name,
            &entry.request_args,
            &entry.request_files,
        )?;

        debug!("Running Wasm function '{}'", entry.function_name);
        let runtime = deployment
            .runtimes
            .get_mut(&entry.module_name)
            .ok_or_else(|| {
                SupervisorError::ModuleLoad(format!(
                    "no runtime for module '{}'",
                    entry.module_name
                ))
            })?;
        let raw_output = runtime.invoke(&entry.module_name, &entry.function_name, wasm_args)?;
        let raw_value = val_to_json(raw_output.as_ref());
        debug!("... Result: {}", raw_value);

        deployment.interpret_call_from(&entry.module_name, &entry.function_name, &raw_value)?
        // Lock released here; the sub-call must not block other invocations.
    };

    if let Some(files) = &next_files {
        entry.outputs = files
            .iter()
            .map(|name| make_output_url(&entry.module_name, name))
            .collect();
    }

    if let Some(call_data) = next_call {
        debug!(
            "Making sub-call from '{}' to '{}'",
            entry.module_name, call_data.url
        );
        return perform_sub_call(&call_data, &entry.module_name);
    }

    // Terminal function: the entry's result is the interpreted output itself,
    // with output files exposed through their serving URLs.
    match next_args {
        Some(EndpointArgs::Scalar(encoded)) => {
            Ok(serde_json::from_str(&encoded).unwrap_or(Value::String(encoded)))
        }
        Some(EndpointArgs::Ordered(values)) => Ok(json!(values)),
        Some(EndpointArgs::Keyed(map)) => Ok(json!(map)),
        None => Ok(json!(entry.outputs)),
    }
}

/// Perform the chained call synchronously, attaching each listed output file
/// as a multipart part keyed by its mount name. The response is expected to
/// be JSON carrying a `resultUrl`.
fn perform_sub_call(call_data: &CallData, module_name: &str) -> Result<Value, SupervisorError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(SUB_CALL_TIMEOUT)
        .build()
        .map_err(|e| SupervisorError::SubCall(format!("could not build client: {}", e)))?;

    let method: reqwest::Method = call_data
        .method
        .to_uppercase()
        .parse()
        .unwrap_or(reqwest::Method::POST);
    let mut request = client.request(method, &call_data.url);
    for (name, value) in &call_data.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    if !call_data.files.is_empty() {
        let mut form = reqwest::blocking::multipart::Form::new();
        for name in &call_data.files {
            let path = module_mount_path(module_name, name);
            let file = std::fs::File::open(&path).map_err(|e| {
                SupervisorError::SubCall(format!(
                    "could not open output file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            form = form.part(
                name.clone(),
                reqwest::blocking::multipart::Part::reader(file).file_name(name.clone()),
            );
        }
        request = request.multipart(form);
    }

    let response = request
        .send()
        .map_err(|e| SupervisorError::SubCall(format!("request to {} failed: {}", call_data.url, e)))?;
    if !response.status().is_success() {
        return Err(SupervisorError::SubCall(format!(
            "{} responded with status {}",
            call_data.url,
            response.status()
        )));
    }
    let body: Value = response.json().map_err(|e| {
        SupervisorError::SubCall(format!("invalid JSON from {}: {}", call_data.url, e))
    })?;
    body.get("resultUrl")
        .cloned()
        .ok_or_else(|| SupervisorError::SubCall(format!("no resultUrl in response from {}", call_data.url)))
}
