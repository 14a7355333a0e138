use std::path::PathBuf;

/// Expand a leading `~` to the current user's home directory.
///
/// Paths without a tilde are returned unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/data"), PathBuf::from("/var/lib/data"));
    }

    #[test]
    fn test_expand_tilde_expands_home() {
        let expanded = expand_tilde("~/reports");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with("reports"));
    }
}
