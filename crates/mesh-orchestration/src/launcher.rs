//! Launching service processes from artifacts
//!
//! An artifact is a `.tar.gz` archive. Launching copies it to a fresh
//! temporary directory, assembles the runtime command line and spawns the
//! process fire and forget: the instance proves itself by registering
//! with the dispatcher, not by being watched.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use mesh_registry::config::DynamicConfig;
use mesh_registry::store::ArtifactRef;
use mesh_registry::variant::ServiceLauncher;
use mesh_registry::{Error, ServiceIdentity};
use tar::Archive;
use tracing::{debug, info, warn};

/// File names inside an artifact that may carry launch flags
const EMBEDDED_FLAG_FILES: &[&str] = &[
    "launch.properties",
    "launch.yaml",
    "launch.yml",
    "launchflags",
];

/// Launches artifacts as OS processes via the configured runtime
#[derive(Debug)]
pub struct ProcessLauncher {
    config: Arc<DynamicConfig>,
}

impl ProcessLauncher {
    /// Create a launcher using the runtime and flags from `config`
    pub fn new(config: Arc<DynamicConfig>) -> Self {
        Self { config }
    }

    /// Flags for an identity: exact version match first, then the
    /// versionless key, then whatever the artifact itself carries
    async fn flags_for(
        &self,
        identity: &ServiceIdentity,
        archive_path: &Path,
    ) -> mesh_registry::Result<Vec<String>> {
        let launch = &self.config.get().launch;
        let configured = launch
            .flags
            .get(&identity.combined())
            .or_else(|| launch.flags.get(&identity.without_version()));
        if let Some(flags) = configured {
            return Ok(split_flags(flags));
        }
        let path = archive_path.to_path_buf();
        smol::unblock(move || embedded_flags(&path)).await
    }
}

#[async_trait]
impl ServiceLauncher for ProcessLauncher {
    async fn launch(
        &self,
        identity: &ServiceIdentity,
        artifact: &ArtifactRef,
        variables: &BTreeMap<String, String>,
    ) -> mesh_registry::Result<()> {
        let work_dir = tempfile::Builder::new()
            .prefix("mesh-launch-")
            .tempdir()
            .map_err(|e| Error::Launch(format!("Cannot create work dir: {e}")))?;
        let archive_path = work_dir.path().join(&artifact.name);
        artifact.store.copy_to(&artifact.name, &archive_path).await?;

        let runtime = self.config.get().launch.runtime.clone();
        let mut command = async_process::Command::new(&runtime);
        command.current_dir(work_dir.path());
        for (key, value) in variables {
            if value.is_empty() {
                continue;
            }
            command.arg(format!("--{key}={value}"));
        }
        for flag in self.flags_for(identity, &archive_path).await? {
            command.arg(flag);
        }
        command.arg(&archive_path);

        info!("Launching {} via {}", identity, runtime);
        debug!("Launch command: {:?}", command);
        let mut child = command
            .spawn()
            .map_err(|e| Error::Launch(format!("Cannot spawn {runtime}: {e}")))?;

        let identity = identity.clone();
        smol::spawn(async move {
            // keep the work dir alive for the lifetime of the process
            let _work_dir = work_dir;
            match child.status().await {
                Ok(status) if status.success() => {
                    info!("Process for {} exited normally", identity)
                }
                Ok(status) => warn!("Process for {} exited with {}", identity, status),
                Err(err) => warn!("Cannot wait for process of {}: {}", identity, err),
            }
        })
        .detach();
        Ok(())
    }
}

/// Read launch flags embedded in the artifact archive, if any
fn embedded_flags(archive_path: &Path) -> mesh_registry::Result<Vec<String>> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.components().count() != 1 || !EMBEDDED_FLAG_FILES.contains(&name) {
            continue;
        }
        let name = name.to_string();
        let mut content = String::new();
        std::io::Read::read_to_string(&mut entry, &mut content)?;
        return Ok(parse_flag_file(&name, &content));
    }
    Ok(Vec::new())
}

fn parse_flag_file(name: &str, content: &str) -> Vec<String> {
    match name {
        "launch.properties" => content
            .lines()
            .filter_map(|line| line.split_once('='))
            .find(|(key, _)| key.trim() == "flags")
            .map(|(_, value)| split_flags(value))
            .unwrap_or_default(),
        "launch.yaml" | "launch.yml" => parse_yaml_flags(content),
        _ => split_flags(content),
    }
}

fn parse_yaml_flags(content: &str) -> Vec<String> {
    let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(content) else {
        return Vec::new();
    };
    match value.get("flags") {
        Some(serde_yaml::Value::String(flags)) => split_flags(flags),
        Some(serde_yaml::Value::Sequence(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn split_flags(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}
