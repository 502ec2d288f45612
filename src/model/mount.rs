//! File mounts: files made available to a module at a module-relative path.
//!
//! Mounts are populated at different stages: deployment-stage files come from
//! the module's data files, execution-stage files from the current request's
//! uploads, and output-stage paths are locations the module is expected to
//! write to, harvested after the call.

use std::path::Component;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::SupervisorError;

/// When a mount is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MountStage {
    Deployment,
    Execution,
    Output,
}

fn default_required() -> bool {
    true
}

fn default_encoding() -> String {
    "base64".to_string()
}

/// A file mounted into a module at `path`, relative to the module's mount
/// root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountPathFile {
    pub path: String,
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<MountStage>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

impl MountPathFile {
    /// Reject paths that are absolute or would escape the mount root.
    pub fn validate_path(&self) -> Result<(), SupervisorError> {
        let path = std::path::Path::new(&self.path);
        if self.path.is_empty() {
            return Err(SupervisorError::Descriptor("empty mount path".to_string()));
        }
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(SupervisorError::Descriptor(format!(
                "mount path \"{}\" escapes the module mount root",
                self.path
            )));
        }
        Ok(())
    }
}

/// The mounts of one function, grouped by stage as they appear on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageMounts {
    #[serde(default)]
    pub deployment: Vec<MountPathFile>,
    #[serde(default)]
    pub execution: Vec<MountPathFile>,
    #[serde(default)]
    pub output: Vec<MountPathFile>,
}

impl StageMounts {
    /// Stamp the stage on each mount and check per-stage path validity and
    /// uniqueness.
    pub fn normalize(&mut self) -> Result<(), SupervisorError> {
        for stage in [
            MountStage::Deployment,
            MountStage::Execution,
            MountStage::Output,
        ] {
            let mounts = match stage {
                MountStage::Deployment => &mut self.deployment,
                MountStage::Execution => &mut self.execution,
                MountStage::Output => &mut self.output,
            };
            let mut seen = std::collections::HashSet::new();
            for mount in mounts.iter_mut() {
                mount.stage = Some(stage);
                mount.validate_path()?;
                if !seen.insert(mount.path.clone()) {
                    return Err(SupervisorError::Descriptor(format!(
                        "duplicate {} mount path \"{}\"",
                        stage, mount.path
                    )));
                }
            }
        }
        Ok(())
    }
}
