use std::path::{Path, PathBuf};

pub const STATE_DIR_ENV: &str = "MCPSWITCH_STATE_DIR";

#[derive(Debug, Clone)]
pub struct SwitchPaths {
    pub runtime_directory: PathBuf,
    pub installed_path: PathBuf,
    pub deleted_path: PathBuf,
    pub secrets_path: PathBuf,
    pub settings_path: PathBuf,
    pub audit_log_path: PathBuf,
}

impl SwitchPaths {
    pub fn detect() -> Self {
        if let Ok(override_dir) = std::env::var(STATE_DIR_ENV) {
            if !override_dir.trim().is_empty() {
                return Self::from_runtime(PathBuf::from(override_dir));
            }
        }

        if let Some(home) = home_dir() {
            return Self::from_runtime(home.join(".mcp_servers"));
        }

        Self::from_runtime(PathBuf::from(".mcp_servers"))
    }

    pub fn from_runtime(runtime_directory: PathBuf) -> Self {
        Self {
            installed_path: runtime_directory.join("installed_mcps.json"),
            deleted_path: runtime_directory.join("deleted_mcps.json"),
            secrets_path: runtime_directory.join("env_vars.json"),
            settings_path: runtime_directory.join("settings.json"),
            audit_log_path: runtime_directory.join("audit-log.json"),
            runtime_directory,
        }
    }

    pub fn ensure_runtime_dir(&self) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.runtime_directory)
    }
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()))
}

/// Directory holding `claude_desktop_config.json` for the current platform.
pub fn claude_desktop_dir(home: &Path) -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home.join("Library").join("Application Support").join("Claude")
    }

    #[cfg(target_os = "windows")]
    {
        home.join("AppData").join("Roaming").join("Claude")
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        home.join(".config").join("Claude")
    }
}

#[cfg(test)]
mod tests {
    use super::SwitchPaths;
    use std::path::PathBuf;

    #[test]
    fn from_runtime_places_every_file_under_runtime_dir() {
        let paths = SwitchPaths::from_runtime(PathBuf::from("/tmp/state"));
        for path in [
            &paths.installed_path,
            &paths.deleted_path,
            &paths.secrets_path,
            &paths.settings_path,
            &paths.audit_log_path,
        ] {
            assert!(path.starts_with("/tmp/state"));
        }
        assert!(paths.secrets_path.ends_with("env_vars.json"));
    }
}
