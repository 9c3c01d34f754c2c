// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use crate::status::Status;

/// Root path. The only path allowed to end in '/' outside of one-level
/// watch scopes.
pub const ROOT: &str = "/";

/// Checks a concrete (non-wildcard) path used by store operations.
/// Must be absolute, segments must be non-empty, '*' is not a valid segment.
pub fn validate(path: &str) -> Result<(), Status> {
    validate_inner(path, false)
}

/// Checks a registration pattern. Same rules as `validate` plus '*' segments
/// and an optional trailing '/' (the one-level watch scope).
pub fn validate_pattern(path: &str) -> Result<(), Status> {
    validate_inner(path, true)
}

fn validate_inner(path: &str, pattern: bool) -> Result<(), Status> {
    if !path.starts_with('/') {
        return Err(Status::InvalidPath);
    }
    if path == ROOT {
        return Ok(());
    }
    let body = if pattern && path.len() > 1 && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    };
    for seg in body[1..].split('/') {
        if seg.is_empty() {
            return Err(Status::InvalidPath);
        }
        if !pattern && seg == "*" {
            return Err(Status::InvalidPath);
        }
        // '*' must be a whole segment; 'eth*' is not supported
        if seg != "*" && seg.contains('*') {
            return Err(Status::InvalidPath);
        }
    }
    Ok(())
}

/// Splits a path into its segments. The root path has no segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .filter(|s| !s.is_empty())
}

/// Parent path, or None at the root. `/a/b` -> `/a`, `/a` -> `/`.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Final segment of a path, or None at the root.
pub fn leaf(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    path.rfind('/').map(|i| &path[i + 1..])
}

/// Joins a parent path and a child segment without doubling slashes.
pub fn join(parent: &str, seg: &str) -> String {
    if parent == ROOT {
        format!("/{}", seg)
    } else {
        format!("{}/{}", parent, seg)
    }
}

/// Does `pattern` match the concrete `path`?
///
/// '*' as an interior segment matches exactly one segment, a trailing '*'
/// segment matches everything at or below that point, and a trailing '/'
/// scopes the pattern to exactly one level below it.
pub fn matches(pattern: &str, path: &str) -> bool {
    let one_level = pattern.len() > 1 && pattern.ends_with('/');
    let pat: Vec<&str> = segments(pattern).collect();
    let segs: Vec<&str> = segments(path).collect();

    if one_level {
        if segs.len() != pat.len() + 1 {
            return false;
        }
        return pat.iter().zip(&segs).all(|(p, s)| *p == "*" || p == s);
    }

    let trailing_wild = pat.last() == Some(&"*");
    if trailing_wild {
        let fixed = &pat[..pat.len() - 1];
        if segs.len() <= fixed.len() {
            return false;
        }
        return fixed.iter().zip(&segs).all(|(p, s)| *p == "*" || p == s);
    }

    if segs.len() != pat.len() {
        return false;
    }
    pat.iter().zip(&segs).all(|(p, s)| *p == "*" || p == s)
}

/// Longest common ancestor of two paths, used to find the root of a
/// multi-leaf document.
pub fn common_root(a: &str, b: &str) -> String {
    let mut out = String::new();
    for (sa, sb) in segments(a).zip(segments(b)) {
        if sa != sb {
            break;
        }
        out.push('/');
        out.push_str(sa);
    }
    if out.is_empty() {
        ROOT.to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(validate("/").is_ok());
        assert!(validate("/a").is_ok());
        assert!(validate("/a/b/c").is_ok());
        assert!(validate("a/b").is_err());
        assert!(validate("/a//b").is_err());
        assert!(validate("/a/b/").is_err());
        assert!(validate("/a/*").is_err());
        assert!(validate_pattern("/a/*").is_ok());
        assert!(validate_pattern("/a/*/c").is_ok());
        assert!(validate_pattern("/a/").is_ok());
        assert!(validate_pattern("/a/eth*").is_err());
    }

    #[test]
    fn test_parent_leaf_join() {
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(leaf("/a/b"), Some("b"));
        assert_eq!(leaf("/"), None);
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_matches_exact_and_interior_wildcard() {
        assert!(matches("/a/b", "/a/b"));
        assert!(!matches("/a/b", "/a/c"));
        assert!(matches("/a/*/c", "/a/x/c"));
        assert!(!matches("/a/*/c", "/a/x/y/c"));
        assert!(matches("/a/*/b/*", "/a/x/b/y"));
        assert!(!matches("/a/*/b/*", "/a/x/c/y"));
    }

    #[test]
    fn test_matches_trailing_forms() {
        // trailing '*' covers the whole subtree
        assert!(matches("/a/*", "/a/b"));
        assert!(matches("/a/*", "/a/b/c/d"));
        assert!(!matches("/a/*", "/a"));
        assert!(!matches("/a/*", "/b/c"));
        // trailing '/' is exactly one level
        assert!(matches("/a/", "/a/b"));
        assert!(!matches("/a/", "/a/b/c"));
        assert!(!matches("/a/", "/a"));
    }

    #[test]
    fn test_common_root() {
        assert_eq!(common_root("/a/b/c", "/a/b/d"), "/a/b");
        assert_eq!(common_root("/a/b", "/x/y"), "/");
        assert_eq!(common_root("/a/b", "/a/b"), "/a/b");
    }
}
