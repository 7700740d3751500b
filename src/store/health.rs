use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHealth {
    pub path: String,
    pub exists: bool,
    pub size_bytes: u64,
    /// Epoch seconds of the last modification.
    pub modified_at: Option<u64>,
    pub line_count: u64,
}

impl FileHealth {
    pub fn probe(path: &Path) -> Self {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(_) => {
                return Self {
                    path: path.to_string_lossy().to_string(),
                    exists: false,
                    size_bytes: 0,
                    modified_at: None,
                    line_count: 0,
                }
            }
        };
        let modified_at = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        // byte segments, so a line with invalid UTF-8 still counts
        let line_count = fs::File::open(path)
            .map(|f| BufReader::new(f).split(b'\n').map_while(Result::ok).count() as u64)
            .unwrap_or(0);
        Self {
            path: path.to_string_lossy().to_string(),
            exists: true,
            size_bytes: meta.len(),
            modified_at,
            line_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub decisions: FileHealth,
    pub grades: FileHealth,
    pub weights: FileHealth,
    pub checked_at: u64,
}

impl StoreHealth {
    /// Decision log present and non-empty.
    pub fn is_serving(&self) -> bool {
        self.decisions.exists && self.decisions.size_bytes > 0
    }
}
