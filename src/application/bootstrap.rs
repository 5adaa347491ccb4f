use crate::infrastructure::config::{ensure_default_configs, load_settings, EngineSettings};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
    pub settings: EngineSettings,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join("remindsync.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let settings = load_settings(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        logs_dir,
        database_path,
        settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TempDir;

    #[test]
    fn bootstrap_creates_layout_and_is_repeatable() {
        let temp = TempDir::new("bootstrap");

        let first = bootstrap_workspace(temp.path()).expect("bootstrap");
        let second = bootstrap_workspace(temp.path()).expect("bootstrap again");

        assert!(first.config_dir.join("app.json").is_file());
        assert!(first.config_dir.join("delivery.json").is_file());
        assert!(first.logs_dir.is_dir());
        assert!(first.database_path.is_file());
        assert_eq!(first.database_path, second.database_path);
        assert_eq!(second.settings, EngineSettings::default());
    }
}
