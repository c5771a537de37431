use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized identity of a file inside the world tree.
///
/// Relative to the reference root, slash-unified, percent-decoded and case-folded.
/// Two raw strings that normalize identically are the same `MediaPath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaPath(String);

impl MediaPath {
    /// Normalize a raw reference string. Returns `None` for strings that do not
    /// denote a relative path (empty, or escaping the root with `..`).
    pub fn parse(raw: &str) -> Option<Self> {
        clean_path(raw).map(|p| MediaPath(p.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased extension without the dot.
    pub fn extension(&self) -> Option<&str> {
        let file = self.0.rsplit('/').next()?;
        let (stem, ext) = file.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            None
        } else {
            Some(ext)
        }
    }

    pub fn starts_with_segment(&self, segment: &str) -> bool {
        self.0
            .split('/')
            .next()
            .map(|first| first == segment)
            .unwrap_or(false)
    }

    /// Replace the first path segment, e.g. `modules/x.png` -> `worlds/x.png`.
    pub fn with_first_segment(&self, segment: &str) -> Option<Self> {
        let (_, rest) = self.0.split_once('/')?;
        Some(MediaPath(format!("{}/{}", segment.to_lowercase(), rest)))
    }
}

impl fmt::Display for MediaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Clean a raw path string without case folding.
///
/// Strips `?query` and `#fragment` suffixes, percent-decodes, unifies separators to `/`,
/// drops `.` segments and empty segments, and resolves `..` within the path.
pub fn clean_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_suffix = trimmed
        .split(['?', '#'])
        .next()
        .unwrap_or(trimmed);

    let decoded = urlencoding::decode(without_suffix)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| without_suffix.to_string());
    let unified = decoded.replace('\\', "/");

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Replace the extension of the last segment of a cleaned path.
pub fn replace_extension(path: &str, new_ext: &str) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    match dir {
        Some(dir) => format!("{}/{}.{}", dir, stem, new_ext),
        None => format!("{}.{}", stem, new_ext),
    }
}

/// Append a suffix to the stem of the last segment and set the extension.
pub fn with_stem_suffix(path: &str, suffix: &str, new_ext: &str) -> String {
    let base = replace_extension(path, new_ext);
    let dot = base.rfind('.').unwrap_or(base.len());
    format!("{}{}{}", &base[..dot], suffix, &base[dot..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_spellings_normalize_identically() {
        let a = MediaPath::parse("worlds/w/Art/Map.PNG").unwrap();
        let b = MediaPath::parse("./worlds\\w//art/map.png").unwrap();
        let c = MediaPath::parse("/worlds/w/art/sub/../map.png?1699").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.as_str(), "worlds/w/art/map.png");
    }

    #[test]
    fn percent_encoding_is_decoded() {
        let a = MediaPath::parse("worlds/w/my%20map.png").unwrap();
        let b = MediaPath::parse("worlds/w/my map.png").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn escaping_root_is_rejected() {
        assert!(MediaPath::parse("../secret.png").is_none());
        assert!(MediaPath::parse("").is_none());
        assert!(MediaPath::parse("   ").is_none());
    }

    #[test]
    fn extension_is_lowercase_and_optional() {
        assert_eq!(MediaPath::parse("a/B.JPEG").unwrap().extension(), Some("jpeg"));
        assert_eq!(MediaPath::parse("a/readme").unwrap().extension(), None);
        assert_eq!(MediaPath::parse("a/.hidden").unwrap().extension(), None);
    }

    #[test]
    fn clean_path_keeps_case() {
        assert_eq!(clean_path("worlds\\W\\Map.png").as_deref(), Some("worlds/W/Map.png"));
    }

    #[test]
    fn first_segment_swap() {
        let p = MediaPath::parse("modules/w/a.png").unwrap();
        assert!(p.starts_with_segment("modules"));
        assert_eq!(p.with_first_segment("worlds").unwrap().as_str(), "worlds/w/a.png");
    }

    #[test]
    fn extension_replacement() {
        assert_eq!(replace_extension("worlds/w/a.png", "webp"), "worlds/w/a.webp");
        assert_eq!(replace_extension("a.tar.png", "webp"), "a.tar.webp");
        assert_eq!(replace_extension("noext", "webp"), "noext.webp");
        assert_eq!(
            with_stem_suffix("worlds/w/a.png", "-0011aabbccdd", "webp"),
            "worlds/w/a-0011aabbccdd.webp"
        );
    }
}
