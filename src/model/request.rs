//! Request entries, request-id generation and the in-memory history log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;

/// Hands out request ids from a per-`(deployment, module, function)`
/// monotonic counter. Counters live for the process lifetime.
#[derive(Default)]
pub struct RequestIdFactory {
    counters: Mutex<HashMap<String, u64>>,
}

impl RequestIdFactory {
    /// Next id for the given function, formatted
    /// `{deployment}:{module}:{function}:{n}`.
    pub fn next_id(&self, deployment_id: &str, module_name: &str, function_name: &str) -> String {
        let key = format!("{}:{}:{}", deployment_id, module_name, function_name);
        let mut counters = self.counters.lock();
        let counter = counters.entry(key.clone()).or_insert(0);
        *counter += 1;
        format!("{}:{}", key, counter)
    }
}

pub static REQUEST_IDS: Lazy<RequestIdFactory> = Lazy::new(RequestIdFactory::default);

/// The record of one invocation.
///
/// `result` and `success` are written exactly once by whoever executes the
/// entry; after that the entry is appended to history and never mutated.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestEntry {
    pub request_id: String,
    pub deployment_id: String,
    pub module_name: String,
    pub function_name: String,
    /// HTTP method the invocation arrived with.
    pub method: String,
    /// Query arguments in arrival order.
    pub request_args: IndexMap<String, String>,
    /// Mount path → staged host path of files uploaded with the request.
    pub request_files: HashMap<String, String>,
    pub work_queued_at: DateTime<Utc>,
    /// Primitive output, output-file reference or sub-call result URL.
    pub result: Option<Value>,
    /// URLs of output files written by the call, if any.
    pub outputs: Vec<String>,
    pub success: bool,
}

impl RequestEntry {
    pub fn new(
        deployment_id: String,
        module_name: String,
        function_name: String,
        method: String,
        request_args: IndexMap<String, String>,
        request_files: HashMap<String, String>,
    ) -> Self {
        let request_id = REQUEST_IDS.next_id(&deployment_id, &module_name, &function_name);
        Self {
            request_id,
            deployment_id,
            module_name,
            function_name,
            method,
            request_args,
            request_files,
            work_queued_at: Utc::now(),
            result: None,
            outputs: Vec::new(),
            success: false,
        }
    }
}

/// Append-only log of completed requests. Entries are only ever pushed;
/// readers observe a stable prefix.
#[derive(Default)]
pub struct RequestHistory {
    entries: Mutex<Vec<RequestEntry>>,
}

impl RequestHistory {
    pub fn append(&self, entry: RequestEntry) {
        self.entries.lock().push(entry);
    }

    /// Linear scan for the entry with the given id.
    pub fn find(&self, request_id: &str) -> Option<RequestEntry> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.request_id == request_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<RequestEntry> {
        self.entries.lock().clone()
    }
}

pub static REQUEST_HISTORY: Lazy<RequestHistory> = Lazy::new(RequestHistory::default);
