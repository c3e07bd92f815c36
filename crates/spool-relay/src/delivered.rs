//! Per-user record of delivered filenames

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Filenames known to be on the remote endpoint, keyed by lowercased user.
///
/// Seeded from the remote listing at startup and appended to after every
/// delivery. Each filename appears at most once per user.
#[derive(Debug, Default)]
pub struct DeliveredFiles {
    files: RwLock<HashMap<String, Vec<String>>>,
}

impl DeliveredFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `filename` for `user`. Returns false if it was already known.
    pub fn record(&self, user: &str, filename: &str) -> bool {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let names = files.entry(user.to_lowercase()).or_default();
        if names.iter().any(|n| n == filename) {
            return false;
        }
        names.push(filename.to_string());
        true
    }

    pub fn userfiles(&self, user: &str) -> Vec<String> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn user_count(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn file_count(&self) -> usize {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}
