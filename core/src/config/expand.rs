use std::env;
use std::path::{Path, PathBuf};

/// Expand a leading `~` or `~/` to the user's home directory.
///
/// On Unix, uses `$HOME`. On Windows, uses `%USERPROFILE%`.
/// `~user` forms and paths without a leading tilde are returned unchanged,
/// as is everything when no home directory is known.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(input) = path.to_str() else {
        return path.to_path_buf();
    };
    if !input.starts_with('~') {
        return path.to_path_buf();
    }
    let rest = &input[1..];
    if !rest.is_empty() && !rest.starts_with('/') && !rest.starts_with('\\') {
        return path.to_path_buf();
    }

    match home_dir() {
        Some(home) => {
            let mut expanded = home;
            expanded.push_str(rest);
            PathBuf::from(expanded)
        }
        None => path.to_path_buf(),
    }
}

fn home_dir() -> Option<String> {
    #[cfg(unix)]
    let home = env::var("HOME").ok();
    #[cfg(windows)]
    let home = env::var("USERPROFILE").ok();
    #[cfg(not(any(unix, windows)))]
    let home: Option<String> = None;
    home.filter(|h| !h.is_empty())
}
