//! Lexical path handling for the virtual tree.
//!
//! Every path that crosses the filesystem interface is normalized to an
//! absolute form with a leading `/`, no trailing `/` (except the root), no
//! empty or `.` segments, and `..` resolved without ever escaping the root.
//! Whiteout keys, base containment checks and dentry walks all rely on this
//! canonical form.

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Normalizes a virtual path to its canonical absolute form.
///
/// `..` components resolve lexically and clamp at the root, so no input can
/// name anything outside the tree.
pub fn normalize_path(path: &str) -> String {
    join_path(&split_path(path))
}

/// Splits a path into its normalized segments.
///
/// Empty and `.` segments are dropped; `..` pops the previous segment (a no-op
/// at the root). The root itself splits into an empty vector.
pub fn split_path(path: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    parts
}

/// Joins normalized segments back into an absolute path.
pub fn join_path(parts: &[String]) -> String {
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Returns the lexical parent of a normalized path. The root is its own
/// parent.
pub fn parent_path(path: &str) -> String {
    let parts = split_path(path);
    if parts.is_empty() {
        return "/".to_string();
    }
    join_path(&parts[..parts.len() - 1])
}

/// Returns the final segment of a normalized path, or `None` for the root.
pub fn file_name(path: &str) -> Option<String> {
    split_path(path).pop()
}

/// Appends a child name to a normalized directory path.
pub fn join_child(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_basic() {
        assert_eq!(normalize_path("/a/b/c"), "/a/b/c");
        assert_eq!(normalize_path("a/b/c"), "/a/b/c");
        assert_eq!(normalize_path("/a/b/c/"), "/a/b/c");
        assert_eq!(normalize_path("//a///b//"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_normalize_path_dots() {
        assert_eq!(normalize_path("/a/./b"), "/a/b");
        assert_eq!(normalize_path("/a/b/.."), "/a");
        assert_eq!(normalize_path("/a/../../b"), "/b");
        assert_eq!(normalize_path("/.."), "/");
        assert_eq!(normalize_path("../../x"), "/x");
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a/b"), vec!["a".to_string(), "b".to_string()]);
        assert!(split_path("/").is_empty());
        assert_eq!(split_path("/a/../b"), vec!["b".to_string()]);
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "/");
        assert_eq!(file_name("/a/b"), Some("b".to_string()));
        assert_eq!(file_name("/"), None);
    }

    #[test]
    fn test_join_child() {
        assert_eq!(join_child("/", "a"), "/a");
        assert_eq!(join_child("/a", "b"), "/a/b");
    }
}
