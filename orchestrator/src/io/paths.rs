//! Canonical paths under `.orchestrator/` for a project root.

use std::path::{Path, PathBuf};

/// All orchestrator-owned paths for a project root.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub chain_state_path: PathBuf,
    pub log_path: PathBuf,
    pub pause_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join(".orchestrator");
        Self {
            root: root.clone(),
            dir: dir.clone(),
            config_path: dir.join("config.toml"),
            state_path: dir.join("state.json"),
            chain_state_path: dir.join("chain_state.json"),
            log_path: dir.join("EXECUTION_LOG.md"),
            pause_path: dir.join("pause"),
        }
    }

    /// Paths committed as tracking artifacts (state + log, not the sentinel).
    pub fn tracking_files(&self) -> Vec<PathBuf> {
        vec![
            self.state_path.clone(),
            self.chain_state_path.clone(),
            self.log_path.clone(),
        ]
    }
}

/// Convenience for display-friendly relative paths in log/commit text.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = OrchestratorPaths::new("/tmp/project");
        assert!(paths.dir.ends_with(".orchestrator"));
        assert!(paths.state_path.ends_with(".orchestrator/state.json"));
        assert!(
            paths
                .chain_state_path
                .ends_with(".orchestrator/chain_state.json")
        );
        assert!(paths.log_path.ends_with(".orchestrator/EXECUTION_LOG.md"));
        assert!(paths.pause_path.ends_with(".orchestrator/pause"));
    }

    #[test]
    fn file_name_falls_back_to_display() {
        assert_eq!(file_name(Path::new("a/b/c.md")), "c.md");
    }
}
