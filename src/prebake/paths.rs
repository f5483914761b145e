use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct PrebakePaths {
    pub prebake_home: PathBuf,
    pub sessions_dir: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

impl PrebakePaths {
    /// Lays out a store rooted at `root`, ignoring the environment.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let prebake_home = root.into();
        Self {
            sessions_dir: prebake_home.join("sessions"),
            logs_dir: prebake_home.join("logs"),
            prebake_home,
        }
    }
}

pub fn resolve_paths() -> Result<PrebakePaths> {
    let home = required_home_dir()?;
    let prebake_home = env_or_default_path("PREBAKE_HOME", home.join(".prebake"));

    let sessions_dir = env_or_default_path("PREBAKE_SESSIONS_DIR", prebake_home.join("sessions"));
    let logs_dir = env_or_default_path("PREBAKE_LOGS_DIR", prebake_home.join("logs"));

    Ok(PrebakePaths {
        prebake_home,
        sessions_dir,
        logs_dir,
    })
}
