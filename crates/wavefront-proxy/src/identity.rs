// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent agent id, so a restarted proxy reports as the same agent.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};
use uuid::Uuid;

/// Returns the id stored in `path`, creating the file with a new UUID v4 when it is missing
/// or blank.
pub fn create_or_get(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let id = contents.trim();
            if !id.is_empty() {
                debug!("Loaded agent id {} from {}", id, path.display());
                return Ok(id.to_string());
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &id)?;
    info!("Generated new agent id {} in {}", id, path.display());
    Ok(id)
}
