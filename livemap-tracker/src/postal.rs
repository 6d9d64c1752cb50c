//! Nearest-postal lookup.
//!
//! The table is a JSON array of `{ "x": f64, "y": f64, "code": "..." }`
//! loaded once at startup. A missing file means no postal codes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, TrackerError};

pub trait PostalLookup: Send + Sync {
    fn nearest(&self, x: f64, y: f64) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Postal {
    pub x: f64,
    pub y: f64,
    pub code: String,
}

#[derive(Debug, Clone, Default)]
pub struct Postals {
    entries: Vec<Postal>,
}

impl Postals {
    pub fn new(entries: Vec<Postal>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, TrackerError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no postal table; postal codes disabled");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let entries: Vec<Postal> = serde_json::from_str(&contents)?;
        tracing::info!(count = entries.len(), "loaded postal table");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PostalLookup for Postals {
    fn nearest(&self, x: f64, y: f64) -> Option<String> {
        self.entries
            .iter()
            .map(|p| {
                let (dx, dy) = (p.x - x, p.y - y);
                (dx * dx + dy * dy, p)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, p)| p.code.clone())
    }
}
