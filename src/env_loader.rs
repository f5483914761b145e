use std::env;
use std::path::PathBuf;

/// Candidate dotenv files in lookup order after the working directory.
fn candidate_paths(
    explicit: Option<PathBuf>,
    prebake_home: Option<PathBuf>,
    home_dir: Option<PathBuf>,
) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(path) = explicit {
        out.push(path);
    }
    if let Some(base) = prebake_home.or(home_dir) {
        out.push(base.join("prebake/.env"));
    }
    out
}

/// Loads variables from the first dotenv file found and returns its path.
/// `PREBAKE_ENV_FILE` wins, then `./.env` (searched upward), then
/// `<PREBAKE_HOME or HOME>/prebake/.env`. Existing variables are never
/// overwritten.
pub fn load_dotenv() -> Option<PathBuf> {
    let explicit = env::var_os("PREBAKE_ENV_FILE")
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty());
    if let Some(path) = &explicit
        && path.is_file()
        && dotenvy::from_path(path).is_ok()
    {
        return Some(path.clone());
    }

    if let Ok(path) = dotenvy::dotenv() {
        return Some(path);
    }

    candidate_paths(
        None,
        env::var_os("PREBAKE_HOME").map(PathBuf::from),
        dirs::home_dir(),
    )
    .into_iter()
    .find(|path| path.is_file() && dotenvy::from_path(path).is_ok())
}

#[cfg(test)]
mod tests {
    use super::candidate_paths;
    use std::path::PathBuf;

    #[test]
    fn explicit_file_comes_before_home_fallback() {
        let got = candidate_paths(
            Some(PathBuf::from("/etc/prebake.env")),
            Some(PathBuf::from("/workspace")),
            Some(PathBuf::from("/home/alice")),
        );
        assert_eq!(
            got,
            vec![
                PathBuf::from("/etc/prebake.env"),
                PathBuf::from("/workspace/prebake/.env"),
            ]
        );
    }

    #[test]
    fn home_is_used_when_prebake_home_unset() {
        let got = candidate_paths(None, None, Some(PathBuf::from("/home/alice")));
        assert_eq!(got, vec![PathBuf::from("/home/alice/prebake/.env")]);
    }

    #[test]
    fn nothing_to_try_without_any_home() {
        assert!(candidate_paths(None, None, None).is_empty());
    }
}
