use std::env;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("HOME environment variable is not set")]
    HomeMissing,
    #[error("path is empty")]
    Empty,
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[from] std::io::Error),
}

/// Expand a leading `~` to the user's home directory.
///
/// Returns the path unchanged if no tilde prefix is present.
///
/// # Errors
/// `HomeMissing` when the path starts with `~` and no home is set.
pub fn expand_tilde(raw: &str) -> Result<PathBuf, PathError> {
    let home = || {
        env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .map_err(|_| PathError::HomeMissing)
    };
    if raw == "~" {
        return Ok(PathBuf::from(home()?));
    }
    match raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        Some(rest) => Ok(Path::new(&home()?).join(rest)),
        None => Ok(PathBuf::from(raw)),
    }
}

/// Remove `.` and resolve `..` without touching the file system.
#[must_use]
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve a configured path against `base` (the config file's directory).
///
/// Rules:
/// - `~` prefix: expand to user home directory
/// - Absolute path: used as-is
/// - Relative path: joined onto `base`
///
/// # Errors
/// `Empty` for a blank path, `HomeMissing` when `~` cannot be expanded.
pub fn resolve_relative(base: &Path, raw: &str) -> Result<PathBuf, PathError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PathError::Empty);
    }
    let expanded = expand_tilde(raw)?;
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };
    Ok(lexical_normalize(&joined))
}

/// Absolute form of `path`, relative to the current directory.
///
/// # Errors
/// When the current directory cannot be read.
pub fn absolutize(path: &Path) -> Result<PathBuf, PathError> {
    if path.is_absolute() {
        return Ok(lexical_normalize(path));
    }
    Ok(lexical_normalize(&env::current_dir()?.join(path)))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn tilde_expands_to_home() {
        temp_env::with_var("HOME", Some("/home/weft"), || {
            assert_eq!(expand_tilde("~").unwrap(), PathBuf::from("/home/weft"));
            assert_eq!(
                expand_tilde("~/services/api").unwrap(),
                PathBuf::from("/home/weft/services/api")
            );
            assert_eq!(expand_tilde("services").unwrap(), PathBuf::from("services"));
        });
    }

    #[test]
    fn tilde_without_home_is_an_error() {
        temp_env::with_vars([("HOME", None::<&str>), ("USERPROFILE", None)], || {
            assert!(matches!(expand_tilde("~/x"), Err(PathError::HomeMissing)));
            // no tilde, no lookup
            assert!(expand_tilde("x").is_ok());
        });
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let base = Path::new("/srv/project");
        assert_eq!(
            resolve_relative(base, "./services/api").unwrap(),
            PathBuf::from("/srv/project/services/api")
        );
        assert_eq!(
            resolve_relative(base, "../shared").unwrap(),
            PathBuf::from("/srv/shared")
        );
        assert_eq!(
            resolve_relative(base, "/opt/web").unwrap(),
            PathBuf::from("/opt/web")
        );
        assert!(matches!(resolve_relative(base, "  "), Err(PathError::Empty)));
    }
}
