//! Declaration manifest loading.
//!
//! Pre-deploy declarations arrive as YAML files on a mounted volume. Each
//! file may hold several documents. Kubernetes volume mounts materialize
//! hidden `..data`/`..2024_...` symlink entries alongside the real files, so
//! directory entries starting with ".." are skipped.

use std::collections::HashMap;
use std::path::Path;

use kube::api::DynamicObject;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Load every declaration document under `dir`, grouped by kind.
pub fn load_declarations(dir: &Path) -> Result<HashMap<String, Vec<DynamicObject>>> {
    let mut by_kind: HashMap<String, Vec<DynamicObject>> = HashMap::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Manifest(format!("cannot read {}: {e}", dir.display())))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::Manifest(format!("cannot read directory entry: {e}")))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("..") {
            debug!(entry = %name, "skipping mount metadata entry");
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Manifest(format!("cannot read {}: {e}", path.display())))?;
        for obj in parse_documents(&content, &name)? {
            let kind = obj
                .types
                .as_ref()
                .map(|t| t.kind.clone())
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::Manifest(format!("{name}: document has no kind")))?;
            by_kind.entry(kind).or_default().push(obj);
        }
    }

    let total: usize = by_kind.values().map(Vec::len).sum();
    info!(
        files = %dir.display(),
        kinds = by_kind.len(),
        declarations = total,
        "loaded declaration manifests"
    );
    Ok(by_kind)
}

/// Parse one YAML file into dynamic objects, tolerating multiple documents
/// and empty documents between separators.
fn parse_documents(content: &str, file_name: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::Manifest(format!("{file_name}: {e}")))?;
        if matches!(value, serde_yaml::Value::Null) {
            continue;
        }
        let json = serde_json::to_value(&value)?;
        let obj: DynamicObject = serde_json::from_value(json)
            .map_err(|e| Error::Manifest(format!("{file_name}: not a Kubernetes object: {e}")))?;
        objects.push(obj);
    }
    Ok(objects)
}
