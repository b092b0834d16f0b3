// src/path.rs
//
// `bucket/key` path model and the string helpers used to walk abstract paths.
// Pure value types; no I/O happens here.

use std::fmt;

use crate::constants::SEP;
use crate::error::{FsError, Result};

/// A parsed `bucket/key/with/segments` path.
///
/// The key never starts or ends with a separator, and the bucket is only
/// empty for the store root.  Equality only looks at `(bucket, key)`.
#[derive(Debug, Clone, Default, Eq)]
pub struct ObjectPath {
    pub full_path: String,
    pub bucket: String,
    pub key: String,
    pub key_parts: Vec<String>,
}

impl ObjectPath {
    /// Parse and validate a path string.
    pub fn parse(s: &str) -> Result<Self> {
        if is_likely_uri(s) {
            return Err(FsError::InvalidPath(format!(
                "Expected an S3 object path of the form 'bucket/key...', got a URI: '{}'",
                s
            )));
        }
        let src = remove_trailing_slash(s);
        match src.find(SEP) {
            Some(0) => Err(FsError::InvalidPath(format!(
                "Path cannot start with a separator ('{}')",
                s
            ))),
            None => Ok(Self {
                full_path: src.to_string(),
                bucket: src.to_string(),
                key: String::new(),
                key_parts: Vec::new(),
            }),
            Some(first_sep) if first_sep + 1 == src.len() => Ok(Self {
                full_path: src[..first_sep].to_string(),
                bucket: src[..first_sep].to_string(),
                key: String::new(),
                key_parts: Vec::new(),
            }),
            Some(first_sep) => {
                let key = &src[first_sep + 1..];
                let key_parts: Vec<String> = key.split(SEP).map(str::to_string).collect();
                if key_parts.iter().any(|p| p.is_empty()) {
                    return Err(FsError::InvalidPath(format!(
                        "Empty path component in path {}",
                        src
                    )));
                }
                Ok(Self {
                    full_path: src.to_string(),
                    bucket: src[..first_sep].to_string(),
                    key: key.to_string(),
                    key_parts,
                })
            }
        }
    }

    /// Build a path from an already-split bucket and key.
    pub fn from_parts(bucket: &str, key: &str) -> Result<Self> {
        if key.is_empty() {
            Self::parse(bucket)
        } else {
            Self::parse(&format!("{}{}{}", bucket, SEP, key))
        }
    }

    pub fn parent(&self) -> Result<Self> {
        if self.key_parts.is_empty() {
            return Err(FsError::InvalidPath(format!(
                "path '{}' has no parent",
                self.full_path
            )));
        }
        let mut key_parts = self.key_parts.clone();
        key_parts.pop();
        let key = key_parts.join("/");
        let full_path = if key.is_empty() {
            self.bucket.clone()
        } else {
            format!("{}{}{}", self.bucket, SEP, key)
        };
        Ok(Self {
            full_path,
            bucket: self.bucket.clone(),
            key,
            key_parts,
        })
    }

    pub fn has_parent(&self) -> bool {
        !self.key.is_empty()
    }

    /// True for the store root (no bucket, no key).
    pub fn is_empty(&self) -> bool {
        self.bucket.is_empty() && self.key.is_empty()
    }

    /// Key with a trailing separator, as used for directory markers and prefixes.
    pub fn dir_key(&self) -> String {
        ensure_trailing_slash(&self.key)
    }

    /// `bucket/key` with each segment percent-encoded, suitable for a copy source.
    pub fn to_url_encoded(&self) -> String {
        use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
        let mut out = utf8_percent_encode(&self.bucket, NON_ALPHANUMERIC).to_string();
        for part in &self.key_parts {
            out.push(SEP);
            out.push_str(&utf8_percent_encode(part, NON_ALPHANUMERIC).to_string());
        }
        out
    }
}

impl PartialEq for ObjectPath {
    fn eq(&self, other: &Self) -> bool {
        self.bucket == other.bucket && self.key == other.key
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path)
    }
}

impl std::str::FromStr for ObjectPath {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Reject paths that denote a regular file with a trailing separator.
pub fn assert_no_trailing_slash(s: &str) -> Result<()> {
    if s.ends_with(SEP) {
        return Err(FsError::NotAFile(s.to_string()));
    }
    Ok(())
}

/// A file path needs both a bucket and a key.
pub fn validate_file_path(path: &ObjectPath) -> Result<()> {
    if path.bucket.is_empty() || path.key.is_empty() {
        return Err(FsError::NotAFile(path.full_path.clone()));
    }
    Ok(())
}

/// Heuristic URI detection: a plausible scheme followed by ':'.
///
/// Single-letter schemes are not considered, so `C:` style drive prefixes pass.
pub fn is_likely_uri(s: &str) -> bool {
    if s.is_empty() || s.starts_with(SEP) {
        return false;
    }
    let Some(pos) = s.find(':') else {
        return false;
    };
    if pos < 2 || pos > 36 {
        return false;
    }
    let scheme = &s[..pos];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
}

/// Strip one trailing separator, if any.
pub fn remove_trailing_slash(s: &str) -> &str {
    s.strip_suffix(SEP).unwrap_or(s)
}

pub fn ensure_trailing_slash(s: &str) -> String {
    if s.is_empty() || s.ends_with(SEP) {
        s.to_string()
    } else {
        format!("{}{}", s, SEP)
    }
}

/// Number of segments in an abstract path, ignoring a leading and a trailing separator.
pub fn path_depth(s: &str) -> usize {
    if s.is_empty() {
        return 0;
    }
    let mut depth = s.matches(SEP).count() + 1;
    if s.ends_with(SEP) {
        depth -= 1;
    }
    if s.starts_with(SEP) {
        depth -= 1;
    }
    depth
}

/// Join `length` segments of `s` starting at segment `offset`.
pub fn slice_path(s: &str, offset: usize, length: usize) -> String {
    if length == 0 {
        return String::new();
    }
    s.split(SEP)
        .filter(|p| !p.is_empty())
        .skip(offset)
        .take(length)
        .collect::<Vec<_>>()
        .join("/")
}

/// Split an abstract path into (parent, basename).  The parent is empty at the top.
pub fn split_parent(s: &str) -> (&str, &str) {
    match s.rfind(SEP) {
        Some(pos) => (&s[..pos], &s[pos + 1..]),
        None => ("", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bucket_and_key() {
        let p = ObjectPath::parse("bucket/a/b/c").unwrap();
        assert_eq!(p.bucket, "bucket");
        assert_eq!(p.key, "a/b/c");
        assert_eq!(p.key_parts, vec!["a", "b", "c"]);
        assert_eq!(p.to_string(), "bucket/a/b/c");
    }

    #[test]
    fn parse_normalizes_trailing_separator() {
        assert_eq!(ObjectPath::parse("bucket/dir/").unwrap().to_string(), "bucket/dir");
        let b = ObjectPath::parse("bucket/").unwrap();
        assert_eq!(b.bucket, "bucket");
        assert!(b.key.is_empty());
        assert!(!b.has_parent());
        assert_eq!(remove_trailing_slash("a//"), "a/");
    }

    #[test]
    fn parse_root() {
        let p = ObjectPath::parse("").unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn parse_rejects_bad_paths() {
        assert!(matches!(ObjectPath::parse("/bucket/key"), Err(FsError::InvalidPath(_))));
        assert!(matches!(ObjectPath::parse("bucket//key"), Err(FsError::InvalidPath(_))));
        assert!(matches!(ObjectPath::parse("bucket/a//"), Err(FsError::InvalidPath(_))));
        let err = ObjectPath::parse("s3://bucket/key").unwrap_err();
        assert!(err.to_string().contains("got a URI"));
        assert!(matches!(ObjectPath::parse("file:///tmp/x"), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn equality_ignores_full_path_spelling() {
        let a = ObjectPath::parse("bucket/x/y/").unwrap();
        let b = ObjectPath::parse("bucket/x/y").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, ObjectPath::parse("other/x/y").unwrap());
    }

    #[test]
    fn parent_chain_terminates() {
        let mut p = ObjectPath::parse("bucket/a/b/c/d").unwrap();
        let mut seen = vec![p.to_string()];
        while p.has_parent() {
            p = p.parent().unwrap();
            seen.push(p.to_string());
        }
        assert_eq!(seen, vec!["bucket/a/b/c/d", "bucket/a/b/c", "bucket/a/b", "bucket/a", "bucket"]);
        assert!(p.parent().is_err());
    }

    #[test]
    fn likely_uri_detection() {
        assert!(is_likely_uri("s3://bucket"));
        assert!(is_likely_uri("http:foo"));
        assert!(!is_likely_uri("C:/data"));
        assert!(!is_likely_uri("bucket/key"));
        assert!(!is_likely_uri("/abs:path"));
        assert!(!is_likely_uri("9p:x"));
    }

    #[test]
    fn depth_and_slice() {
        assert_eq!(path_depth(""), 0);
        assert_eq!(path_depth("a"), 1);
        assert_eq!(path_depth("a/"), 1);
        assert_eq!(path_depth("/a/b/"), 2);
        assert_eq!(path_depth("a/b/c"), 3);
        assert_eq!(slice_path("a/b/c/d", 0, 2), "a/b");
        assert_eq!(slice_path("a/b/c/d", 1, 2), "b/c");
        assert_eq!(slice_path("a/b", 0, 5), "a/b");
        assert_eq!(slice_path("a/b", 0, 0), "");
    }

    #[test]
    fn split_parent_walks_up() {
        assert_eq!(split_parent("b/a/x"), ("b/a", "x"));
        assert_eq!(split_parent("b"), ("", "b"));
    }

    #[test]
    fn url_encoding_keeps_separators() {
        let p = ObjectPath::parse("bucket/dir with space/a+b").unwrap();
        assert_eq!(p.to_url_encoded(), "bucket/dir%20with%20space/a%2Bb");
    }

    #[test]
    fn file_path_validation() {
        assert!(validate_file_path(&ObjectPath::parse("bucket").unwrap()).is_err());
        assert!(validate_file_path(&ObjectPath::parse("bucket/k").unwrap()).is_ok());
        assert!(assert_no_trailing_slash("bucket/k/").is_err());
    }
}
