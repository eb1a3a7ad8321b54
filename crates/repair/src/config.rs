use crate::RepairError;
use serde::{Deserialize, Serialize};

/// Thresholds for detecting and rebuilding degenerate page trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Run the scan at all
    pub enabled: bool,
    /// Maximum children per node after a rebuild
    pub branching_factor: usize,
    /// A `/Kids` array with more entries than this is oversized
    pub kids_threshold: usize,
    /// A `/Count` above this marks a document worth rebuilding
    pub count_threshold: u64,
    /// Bytes held in memory at once while scanning
    pub window_bytes: usize,
    /// Hard cap on bytes scanned per document
    pub max_scan_bytes: u64,
    /// Inconclusive scans of files at least this large are repaired anyway
    pub suspect_min_bytes: u64,
    /// Inconclusive scans of sources whose name matches are repaired anyway
    pub suspect_patterns: Vec<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            branching_factor: 32,
            kids_threshold: 1000,
            count_threshold: 3000,
            window_bytes: 64 * 1024,
            max_scan_bytes: 64 * 1024 * 1024,
            suspect_min_bytes: 256 * 1024 * 1024,
            suspect_patterns: vec![
                r"(?i)flat[-_ ]?pages".to_owned(),
                r"(?i)\d{4,}[-_ ]?pages".to_owned(),
            ],
        }
    }
}

impl RepairConfig {
    pub fn with_branching_factor(mut self, branching_factor: usize) -> Self {
        self.branching_factor = branching_factor;
        self
    }

    pub fn with_thresholds(mut self, kids: usize, count: u64) -> Self {
        self.kids_threshold = kids;
        self.count_threshold = count;
        self
    }

    pub fn validate(&self) -> Result<(), RepairError> {
        if self.branching_factor < 2 {
            return Err(RepairError::InvalidConfig(format!(
                "branching_factor must be at least 2, got {}",
                self.branching_factor
            )));
        }
        if self.window_bytes == 0 {
            return Err(RepairError::InvalidConfig(
                "window_bytes must be greater than 0".to_owned(),
            ));
        }
        regex::RegexSet::new(&self.suspect_patterns)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        RepairConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_degenerate_branching() {
        let config = RepairConfig::default().with_branching_factor(1);
        assert!(matches!(
            config.validate(),
            Err(RepairError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let config = RepairConfig {
            suspect_patterns: vec!["(unclosed".to_owned()],
            ..RepairConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RepairError::InvalidPattern(_))
        ));
    }
}
