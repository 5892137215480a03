use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DATABASE_PATH_ENV: &str = "DATABASE_PATH";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_DATABASE_FILE: &str = "gateway.db";

/// Pick the database file: explicit path first, then `DATABASE_PATH`, then
/// `data/gateway.db`. The parent directory is created when missing.
///
/// # Errors
/// Returns an error when the parent directory cannot be created.
pub fn resolve_database_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let env_value = std::env::var_os(DATABASE_PATH_ENV);
    let path = database_path_from(explicit, env_value.as_deref().map(Path::new));

    if path != Path::new(":memory:") {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    Ok(path)
}

fn database_path_from(explicit: Option<&Path>, env_value: Option<&Path>) -> PathBuf {
    explicit
        .or(env_value.filter(|value| !value.as_os_str().is_empty()))
        .map_or_else(
            || Path::new(DEFAULT_DATA_DIR).join(DEFAULT_DATABASE_FILE),
            Path::to_path_buf,
        )
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    #[test]
    fn explicit_path_wins_over_environment() {
        let path = database_path_from(Some(Path::new("/srv/a.db")), Some(Path::new("/srv/b.db")));
        assert_eq!(path, PathBuf::from("/srv/a.db"));
    }

    #[test]
    fn environment_is_used_without_explicit_path() {
        let path = database_path_from(None, Some(Path::new("/srv/b.db")));
        assert_eq!(path, PathBuf::from("/srv/b.db"));
    }

    #[test]
    fn default_path_is_inside_data_directory() {
        assert_eq!(database_path_from(None, None), PathBuf::from("data/gateway.db"));
        assert_eq!(database_path_from(None, Some(Path::new(""))), PathBuf::from("data/gateway.db"));
    }

    #[test]
    fn missing_parent_directory_is_created() -> Result<()> {
        let root = std::env::temp_dir().join(format!("deploy-tracker-location-{}", Ulid::new()));
        let target = root.join("nested").join("tracker.db");

        let resolved = resolve_database_path(Some(&target))?;
        assert_eq!(resolved, target);
        assert!(root.join("nested").is_dir());

        fs::remove_dir_all(&root)
            .with_context(|| format!("failed to cleanup {}", root.display()))?;
        Ok(())
    }

    #[test]
    fn in_memory_path_is_left_alone() -> Result<()> {
        assert_eq!(resolve_database_path(Some(Path::new(":memory:")))?, PathBuf::from(":memory:"));
        Ok(())
    }
}
