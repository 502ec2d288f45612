//! Forwarding of significant events to an external logging sidecar.
//!
//! When `WASMIOT_LOGGING_ENDPOINT` is set, log entries are POSTed there as
//! JSON in addition to the local `log` output. Disabled silently otherwise.

use chrono::Utc;
use log::warn;
use serde_json::json;
use std::env;
use std::time::Duration;

use crate::util::constants::SUPERVISOR_DEFAULT_NAME;

/// Send one log entry to the logging sidecar, blocking until done.
///
/// Safe to call from the worker thread and from `spawn_blocking` contexts;
/// must not be called directly on a reactor thread.
pub fn send_log(level: &str, message: &str, func_name: &str) {
    let Ok(endpoint) = env::var("WASMIOT_LOGGING_ENDPOINT") else {
        return;
    };

    let entry = json!({"logData": {
        "timestamp": Utc::now().to_rfc3339(),
        "loglevel": level,
        "message": message,
        "funcName": func_name,
        "deviceName": env::var("SUPERVISOR_NAME")
            .unwrap_or_else(|_| SUPERVISOR_DEFAULT_NAME.to_string()),
        "deviceIP": device_ip(),
    }});

    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to build logging client: {}", e);
            return;
        }
    };
    if let Err(e) = client.post(&endpoint).json(&entry).send() {
        warn!("Failed to send log to {}: {}", endpoint, e);
    }
}

/// Fire-and-forget variant for async handlers.
pub fn spawn_log(level: &'static str, message: String, func_name: String) {
    tokio::task::spawn_blocking(move || send_log(level, &message, &func_name));
}

/// Determine the address reported in forwarded log entries.
fn device_ip() -> String {
    env::var("SERVER_NAME").unwrap_or_else(|_| {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string())
    })
}

/// Expands to the fully qualified name of the enclosing function.
/// Source: https://stackoverflow.com/questions/38088067/equivalent-of-func-or-function-in-rust
#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        name.strip_suffix("::f").unwrap()
    }};
}
