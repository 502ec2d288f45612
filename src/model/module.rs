//! Module identity and on-disk artifacts: the fetched binary and the data
//! files it was deployed with.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Data file name that marks a module's ML model.
pub const DEFAULT_MODEL_FILE: &str = "model.pb";

/// Pointer to an ML model carried among a module's data files, together with
/// the exported function names used to feed it into the module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MLModel {
    pub path: PathBuf,
    pub alloc_function_name: String,
    pub infer_function_name: String,
}

impl MLModel {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            alloc_function_name: "alloc".to_string(),
            infer_function_name: "infer_from_ptrs".to_string(),
        }
    }
}

/// What a module instance for running functions is created from: name, binary
/// location and the mount-path → host-path map of its deployment-stage files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub data_files: HashMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_model: Option<MLModel>,
}

impl ModuleConfig {
    pub fn new(
        id: String,
        name: String,
        path: PathBuf,
        data_files: HashMap<String, PathBuf>,
    ) -> Self {
        Self {
            id,
            name,
            path,
            data_files,
            ml_model: None,
        }
    }

    /// Mark the conventional model data file as this module's ML model, if
    /// present.
    pub fn set_model_from_data_files(&mut self) {
        if let Some(path) = self.data_files.get(DEFAULT_MODEL_FILE) {
            self.ml_model = Some(MLModel::new(path.clone()));
        }
    }
}
