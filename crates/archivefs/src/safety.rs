//! Path normalization for archive entry names and lookup paths.
//!
//! Archives store names with either separator and sometimes with leading
//! slashes, `.` segments or even `..` segments. The namespace works on
//! `/`-separated component lists only, so every name goes through here
//! before it reaches the tree.

/// Splits an archive entry name into namespace components.
///
/// Both `/` and `\` are accepted as separators. Empty and `.` segments are
/// dropped. Returns `None` for names that would escape the archive root
/// (any `..` segment) or that normalize to nothing.
///
/// # Examples
///
/// ```
/// use archivefs::safety::normalize_entry_path;
///
/// assert_eq!(
///     normalize_entry_path("dir\\sub/./file.txt"),
///     Some(vec!["dir".to_string(), "sub".to_string(), "file.txt".to_string()])
/// );
///
/// // Traversal attempts never reach the tree
/// assert_eq!(normalize_entry_path("../../etc/passwd"), None);
/// ```
pub fn normalize_entry_path(name: &str) -> Option<Vec<String>> {
    let mut components = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            _ => components.push(part.to_string()),
        }
    }

    if components.is_empty() {
        None
    } else {
        Some(components)
    }
}

/// Splits a lookup path coming from the filesystem driver.
///
/// The root is `""` or `"/"`. Unlike entry names, a lookup containing `..`
/// is not an error here; it simply cannot match anything, which callers
/// report as not found.
pub fn split_lookup_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

/// Renders components as an absolute `/`-separated path.
pub fn join_components<S: AsRef<str>>(components: &[S]) -> String {
    let mut out = String::new();
    for component in components {
        out.push('/');
        out.push_str(component.as_ref());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
