//! Path resolver — bare executable name to a verified absolute path.

use dashmap::DashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Memoizing PATH lookup.
///
/// A hit is cached for the life of the resolver. A stale entry later fails
/// as an ordinary execution error, so the cache is never invalidated.
#[derive(Debug, Default)]
pub struct PathResolver {
    resolved: DashMap<String, PathBuf>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, command: &str) -> Result<PathBuf> {
        if let Some(path) = self.resolved.get(command) {
            return Ok(path.clone());
        }

        let not_found = || BridgeError::NotFound {
            command: command.to_string(),
        };

        let path = which::which(command).map_err(|e| {
            debug!("which({command}) failed: {e}");
            not_found()
        })?;

        // a misleading PATH entry must look exactly like "not found"
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(not_found()),
        }

        debug!("Resolved {command} -> {}", path.display());
        self.resolved.insert(command.to_string(), path.clone());
        Ok(path)
    }

    pub fn cached_count(&self) -> usize {
        self.resolved.len()
    }
}
