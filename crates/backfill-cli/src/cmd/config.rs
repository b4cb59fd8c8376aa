use std::path::PathBuf;

use backfill_core::config;
use backfill_types::error::{BackfillError, Result};

pub(crate) fn run_config_generate(dest: Option<&str>) -> Result<PathBuf> {
    let path = PathBuf::from(dest.unwrap_or("rbd-backfill.yaml"));
    if path.exists() {
        return Err(BackfillError::AlreadyExists(format!(
            "file already exists: {}",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&path, config::minimal_config_template())?;
    Ok(path)
}
