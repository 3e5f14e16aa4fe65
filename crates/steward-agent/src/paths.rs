use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelPathError {
    Absolute,
    Traversal,
}

impl std::fmt::Display for RelPathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelPathError::Absolute => f.write_str("path must be relative"),
            RelPathError::Traversal => f.write_str("path traversal is not allowed"),
        }
    }
}

/// Normalizes a relative path, denying absolute paths and any `..` component.
pub(crate) fn normalize_rel_path(rel: &str) -> Result<PathBuf, RelPathError> {
    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(RelPathError::Absolute);
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(RelPathError::Traversal),
            Component::Prefix(_) | Component::RootDir => return Err(RelPathError::Absolute),
        }
    }
    Ok(out)
}

/// Definition names become file stems, so they are restricted to a portable alphabet.
pub(crate) fn is_valid_definition_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_cur_dir() {
        assert_eq!(
            normalize_rel_path("./world/./region").unwrap(),
            PathBuf::from("world/region")
        );
    }

    #[test]
    fn normalize_rejects_escape_attempts() {
        assert_eq!(normalize_rel_path("../etc"), Err(RelPathError::Traversal));
        assert_eq!(normalize_rel_path("a/../../b"), Err(RelPathError::Traversal));
        assert_eq!(normalize_rel_path("/etc/passwd"), Err(RelPathError::Absolute));
    }

    #[test]
    fn definition_names() {
        assert!(is_valid_definition_name("minecraft-1.20_lobby"));
        assert!(!is_valid_definition_name(""));
        assert!(!is_valid_definition_name(".hidden"));
        assert!(!is_valid_definition_name("../escape"));
        assert!(!is_valid_definition_name("a/b"));
    }
}
