use std::{collections::HashMap, sync::RwLock};

use crate::path::split_path;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory prefix trie of whiteout paths.
///
/// Every read operation on the merged view starts with an ancestor check
/// here, so it runs in O(path depth) instead of a database query. The store's
/// whiteout table stays authoritative: the index is updated only after the
/// corresponding store change commits, and it is rebuilt from the table on
/// startup or on any doubt.
pub struct WhiteoutIndex {
    root: RwLock<WhiteoutNode>,
}

#[derive(Default)]
struct WhiteoutNode {
    children: HashMap<String, WhiteoutNode>,
    is_whiteout: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WhiteoutIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            root: RwLock::new(WhiteoutNode::default()),
        }
    }

    /// Replaces the contents of the index with the given paths.
    pub fn load(&self, paths: &[String]) {
        let mut root = self.root.write().expect("whiteout index lock poisoned");
        *root = WhiteoutNode::default();
        for path in paths {
            insert_into(&mut root, path);
        }
    }

    /// Adds a whiteout for the given path.
    pub fn insert(&self, path: &str) {
        let mut root = self.root.write().expect("whiteout index lock poisoned");
        insert_into(&mut root, path);
    }

    /// Removes the whiteout for the given path, pruning nodes that are
    /// neither whiteouts nor ancestors of one.
    pub fn remove(&self, path: &str) {
        let parts = split_path(path);
        if parts.is_empty() {
            return;
        }
        let mut root = self.root.write().expect("whiteout index lock poisoned");
        remove_from(&mut root, &parts);
    }

    /// Returns true if there is a whiteout for the exact path.
    pub fn has_exact(&self, path: &str) -> bool {
        let root = self.root.read().expect("whiteout index lock poisoned");
        let mut node = &*root;
        for part in split_path(path) {
            match node.children.get(&part) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.is_whiteout
    }

    /// Returns true if the path or any of its ancestors is whited out.
    ///
    /// This is the pre-filter every merged-view operation runs first.
    pub fn has_ancestor(&self, path: &str) -> bool {
        let root = self.root.read().expect("whiteout index lock poisoned");
        let mut node = &*root;
        for part in split_path(path) {
            match node.children.get(&part) {
                Some(child) => node = child,
                None => return false,
            }
            if node.is_whiteout {
                return true;
            }
        }
        false
    }

    /// Returns the names of direct children of `dir_path` that are whited
    /// out.
    pub fn child_whiteouts(&self, dir_path: &str) -> Vec<String> {
        let root = self.root.read().expect("whiteout index lock poisoned");
        let mut node = &*root;
        for part in split_path(dir_path) {
            match node.children.get(&part) {
                Some(child) => node = child,
                None => return Vec::new(),
            }
        }
        node.children
            .iter()
            .filter(|(_, child)| child.is_whiteout)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns every whiteout path in the index.
    pub fn all(&self) -> Vec<String> {
        let root = self.root.read().expect("whiteout index lock poisoned");
        let mut paths = Vec::new();
        collect(&root, "", &mut paths);
        paths
    }

    /// Removes every whiteout.
    pub fn clear(&self) {
        let mut root = self.root.write().expect("whiteout index lock poisoned");
        *root = WhiteoutNode::default();
    }
}

impl Default for WhiteoutIndex {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn insert_into(root: &mut WhiteoutNode, path: &str) {
    let mut node = root;
    for part in split_path(path) {
        node = node.children.entry(part).or_default();
    }
    node.is_whiteout = true;
}

/// Clears the flag on the terminal node and prunes empty non-whiteout nodes
/// bottom-up. Returns true if the child at `parts[0]` should be dropped.
fn remove_from(node: &mut WhiteoutNode, parts: &[String]) -> bool {
    let Some((name, rest)) = parts.split_first() else {
        return false;
    };
    let Some(child) = node.children.get_mut(name) else {
        return false;
    };

    if rest.is_empty() {
        child.is_whiteout = false;
    } else if !remove_from(child, rest) {
        return false;
    }

    if child.children.is_empty() && !child.is_whiteout {
        node.children.remove(name);
        true
    } else {
        false
    }
}

fn collect(node: &WhiteoutNode, prefix: &str, paths: &mut Vec<String>) {
    if node.is_whiteout && !prefix.is_empty() {
        paths.push(prefix.to_string());
    }
    for (name, child) in &node.children {
        collect(child, &format!("{prefix}/{name}"), paths);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whiteout_exact_and_ancestor() {
        let index = WhiteoutIndex::new();
        index.insert("/a/b");

        assert!(index.has_exact("/a/b"));
        assert!(!index.has_exact("/a"));
        assert!(!index.has_exact("/a/b/c"));

        assert!(index.has_ancestor("/a/b"));
        assert!(index.has_ancestor("/a/b/c/d"));
        assert!(!index.has_ancestor("/a"));
        assert!(!index.has_ancestor("/a/x"));
    }

    #[test]
    fn test_whiteout_children() {
        let index = WhiteoutIndex::new();
        index.insert("/dir/one");
        index.insert("/dir/two");
        index.insert("/dir/sub/three");

        let mut names = index.child_whiteouts("/dir");
        names.sort();
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
        assert!(index.child_whiteouts("/other").is_empty());
    }

    #[test]
    fn test_whiteout_remove_prunes() {
        let index = WhiteoutIndex::new();
        index.insert("/a/b/c");
        index.insert("/a/b");

        index.remove("/a/b/c");
        assert!(!index.has_exact("/a/b/c"));
        // "/a/b" is still a whiteout, so the subtree survives.
        assert!(index.has_exact("/a/b"));

        index.remove("/a/b");
        assert!(!index.has_ancestor("/a/b/anything"));
        assert!(index.all().is_empty());
    }

    #[test]
    fn test_whiteout_remove_keeps_needed_interior_nodes() {
        let index = WhiteoutIndex::new();
        index.insert("/a/b/c");
        index.insert("/a/x");

        index.remove("/a/b/c");
        assert!(index.has_exact("/a/x"));
        assert_eq!(index.all(), vec!["/a/x".to_string()]);
    }

    #[test]
    fn test_whiteout_load_replaces_contents() {
        let index = WhiteoutIndex::new();
        index.insert("/old");

        index.load(&["/new/one".to_string(), "/new/two".to_string()]);
        assert!(!index.has_exact("/old"));
        assert!(index.has_exact("/new/one"));

        let mut all = index.all();
        all.sort();
        assert_eq!(all, vec!["/new/one".to_string(), "/new/two".to_string()]);
    }

    #[test]
    fn test_whiteout_mixed_sequences_match_reference() {
        use std::collections::HashSet;

        // Drive the trie with a scripted insert/remove sequence and compare
        // against a plain set of paths after every step.
        let ops = [
            ("insert", "/a"),
            ("insert", "/a/b"),
            ("insert", "/c/d/e"),
            ("remove", "/a"),
            ("insert", "/c"),
            ("remove", "/c/d/e"),
            ("remove", "/never/there"),
            ("insert", "/a/b"),
            ("remove", "/a/b"),
        ];

        let index = WhiteoutIndex::new();
        let mut reference: HashSet<String> = HashSet::new();

        for (op, path) in ops {
            match op {
                "insert" => {
                    index.insert(path);
                    reference.insert(path.to_string());
                }
                _ => {
                    index.remove(path);
                    reference.remove(path);
                }
            }

            let trie: HashSet<String> = index.all().into_iter().collect();
            assert_eq!(trie, reference, "divergence after {op} {path}");
            for path in &reference {
                assert!(index.has_exact(path));
            }
        }
    }
}
