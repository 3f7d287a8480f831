use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "kpxc";
pub const APP_NAME: &str = "kpxc-client";

pub fn data_dir() -> Option<PathBuf> {
    if let Ok(override_dir) = std::env::var("KPXC_DATA_DIR") {
        return Some(PathBuf::from(override_dir));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)?;
    Some(dirs.data_dir().to_path_buf())
}

pub fn config_dir() -> Option<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)?;
    Some(dirs.config_dir().to_path_buf())
}

/// Where [`crate::FileRegistry`] keeps associations by default.
pub fn registry_path() -> Option<PathBuf> {
    if let Ok(override_path) = std::env::var("KPXC_REGISTRY") {
        return Some(PathBuf::from(override_path));
    }
    Some(data_dir()?.join("registry.json"))
}

pub fn config_path() -> Option<PathBuf> {
    Some(config_dir()?.join("config.json"))
}
