//! Id and path normalization helpers

use url::Url;

/// Prefix marking a virtual (non-path) request id
pub const VALID_ID_PREFIX: &str = "/@id/";

/// Stand-in for NUL bytes inside wrapped ids
pub const NULL_BYTE_PLACEHOLDER: &str = "__x00__";

/// Builtins that keep their scheme when normalized
const PREFIXED_BUILTINS: &[&str] = &["node:test"];

/// Convert backslashes to forward slashes
pub fn slash(path: &str) -> String {
    path.replace('\\', "/")
}

/// Append a trailing slash if missing
pub fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Wrap a virtual id so it can travel as a server path
pub fn wrap_id(id: &str) -> String {
    if id.starts_with(VALID_ID_PREFIX) {
        id.to_string()
    } else {
        format!("{}{}", VALID_ID_PREFIX, id.replace('\0', NULL_BYTE_PLACEHOLDER))
    }
}

/// Undo [`wrap_id`]
pub fn unwrap_id(id: &str) -> String {
    match id.strip_prefix(VALID_ID_PREFIX) {
        Some(rest) => rest.replace(NULL_BYTE_PLACEHOLDER, "\0"),
        None => id.to_string(),
    }
}

/// Strip the query and hash from a url
pub fn clean_url(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Transform a resolved file path into a canonical module id.
///
/// `root` must end with a slash.
///
/// ```text
/// virtual:custom  -> virtual:custom
/// /root/id.js     -> /id.js
/// C:\root\id.js   -> /id.js   (with root "C:/root/")
/// /@fs/abs/id.js  -> /abs/id.js
/// file:///id.js   -> /id.js
/// ```
pub fn normalize_module_id(file: &str, root: &str) -> String {
    if PREFIXED_BUILTINS.contains(&file) {
        return file.to_string();
    }

    let mut unix_file = slash(file);
    if let Some(rest) = unix_file.strip_prefix("/@fs/") {
        unix_file = if cfg!(windows) {
            rest.to_string()
        } else {
            format!("/{}", rest)
        };
    }
    if let Some(rest) = unix_file.strip_prefix("node:") {
        unix_file = rest.to_string();
    }
    if unix_file.starts_with("//") {
        unix_file = format!("/{}", unix_file.trim_start_matches('/'));
    }

    if unix_file.starts_with(root) {
        // keep the leading slash
        unix_file = unix_file[root.len() - 1..].to_string();
    }

    match unix_file.strip_prefix("file:/") {
        Some(rest) => format!("/{}", rest.trim_start_matches('/')),
        None => unix_file,
    }
}

/// Whether a path is absolute in either posix or windows form
pub fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    match bytes {
        [b'/' | b'\\', ..] => true,
        [drive, b':', b'/' | b'\\', ..] => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

/// Directory part of a posix path
pub fn posix_dirname(path: &str) -> String {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Resolve `.` and `..` segments
fn normalize_segments(path: &str, allow_above_root: bool) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if allow_above_root {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn cwd() -> String {
    std::env::current_dir()
        .map(|dir| slash(&dir.to_string_lossy()))
        .unwrap_or_else(|_| "/".to_string())
}

/// Resolve path segments right to left until an absolute path is formed
pub fn posix_resolve(segments: &[&str]) -> String {
    let mut resolved = String::new();
    let mut absolute = false;

    for segment in segments.iter().rev() {
        let segment = slash(segment);
        if segment.is_empty() {
            continue;
        }
        resolved = format!("{}/{}", segment, resolved);
        if is_absolute(&segment) {
            absolute = true;
            break;
        }
    }

    if !absolute {
        let base = cwd();
        absolute = is_absolute(&base);
        resolved = format!("{}/{}", base, resolved);
    }

    let normalized = normalize_segments(&resolved, !absolute);
    if absolute && !is_absolute(&normalized) {
        format!("/{}", normalized)
    } else if normalized.is_empty() {
        ".".to_string()
    } else {
        normalized
    }
}

fn encode_path_chars(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '\\' if !cfg!(windows) => encoded.push_str("%5C"),
            '\n' => encoded.push_str("%0A"),
            '\r' => encoded.push_str("%0D"),
            '\t' => encoded.push_str("%09"),
            '?' => encoded.push_str("%3F"),
            '#' => encoded.push_str("%23"),
            ' ' => encoded.push_str("%20"),
            other => encoded.push(other),
        }
    }
    encoded
}

/// `file://` href for a posix path
pub fn posix_path_to_file_href(path: &str) -> String {
    let resolved = posix_resolve(&[path]);
    let trailing_slash = path.ends_with('/') && !resolved.ends_with('/');
    match Url::from_file_path(&resolved) {
        Ok(mut url) => {
            if trailing_slash && !url.path().ends_with('/') {
                let with_slash = format!("{}/", url.path());
                url.set_path(&with_slash);
            }
            url.to_string()
        }
        // Not an absolute path on this platform
        Err(()) => {
            let mut href = format!("file://{}", encode_path_chars(&resolved));
            if trailing_slash {
                href.push('/');
            }
            href
        }
    }
}
