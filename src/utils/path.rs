//! Nut path utilities.
//!
//! Pure functions for `/`-separated logical paths. Nut names never use the
//! platform separator, so `std::path` is not involved here.

use percent_encoding::percent_decode_str;

/// Join path segments with exactly one `/` between them.
///
/// Empty segments are skipped. A leading `/` on the first non-empty segment
/// is kept.
///
/// # Examples
/// ```
/// use nutflow::utils::path::merge_path;
/// assert_eq!(merge_path(&["/", "", "wf", "42", "a.css"]), "/wf/42/a.css");
/// assert_eq!(merge_path(&["img/", "/logo.png"]), "img/logo.png");
/// ```
pub fn merge_path(segments: &[&str]) -> String {
    let mut out = String::new();
    for seg in segments.iter().filter(|s| !s.is_empty()) {
        if out.is_empty() {
            out.push_str(seg);
            continue;
        }
        match (out.ends_with('/'), seg.starts_with('/')) {
            (true, true) => out.push_str(&seg[1..]),
            (false, false) => {
                out.push('/');
                out.push_str(seg);
            }
            _ => out.push_str(seg),
        }
    }
    out
}

/// Resolve `.` and `..` segments.
///
/// Returns `None` when the path climbs above its root.
///
/// # Examples
/// ```
/// use nutflow::utils::path::simplify;
/// assert_eq!(simplify("css/../img/./a.png").as_deref(), Some("img/a.png"));
/// assert_eq!(simplify("../a.png"), None);
/// ```
pub fn simplify(path: &str) -> Option<String> {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    Some(if absolute { format!("/{joined}") } else { joined })
}

/// Directory part of a nut name, with its trailing `/` (empty at root).
///
/// # Examples
/// ```
/// use nutflow::utils::path::parent_dir;
/// assert_eq!(parent_dir("css/site/main.css"), "css/site/");
/// assert_eq!(parent_dir("main.css"), "");
/// ```
pub fn parent_dir(name: &str) -> &str {
    name.rfind('/').map_or("", |pos| &name[..=pos])
}

/// Check if a reference points outside any store.
///
/// Scheme URLs (`https:`, `data:`, `mailto:`), protocol-relative URLs and
/// pure fragments are external.
pub fn is_external_link(link: &str) -> bool {
    if link.starts_with("//") || link.starts_with('#') {
        return true;
    }
    link.find(':').is_some_and(|pos| {
        pos > 0
            && link[..pos]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    })
}

/// Split a reference into its path and its `?query`/`#fragment` suffix.
///
/// # Examples
/// ```
/// use nutflow::utils::path::split_suffix;
/// assert_eq!(split_suffix("font.woff?v=1#x"), ("font.woff", "?v=1#x"));
/// assert_eq!(split_suffix("a.png"), ("a.png", ""));
/// ```
pub fn split_suffix(reference: &str) -> (&str, &str) {
    match reference.find(['?', '#']) {
        Some(pos) => reference.split_at(pos),
        None => (reference, ""),
    }
}

/// Percent-decode a reference path (`my%20file.png` -> `my file.png`).
pub fn decode(path: &str) -> String {
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

/// Extension of a nut name including the dot, if any.
pub fn extension(name: &str) -> Option<&str> {
    let file = name.rsplit('/').next().unwrap_or(name);
    file.rfind('.').filter(|&pos| pos > 0).map(|pos| &file[pos..])
}
