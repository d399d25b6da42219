use chrono::{DateTime, Utc};

/// Normalizes a path to forward-slash, no leading slash, no trailing slash.
/// The wire format and `Asset::path` both use this form regardless of host
/// platform, matching the `pyosf` convention of storing paths as plain
/// forward-slash strings.
pub fn normalize(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    replaced.trim_matches('/').to_string()
}

fn split_ext(path: &str) -> (&str, &str) {
    match path.rfind('.') {
        // a dot with no preceding filename segment (e.g. ".gitignore") has no extension
        Some(idx) if idx > path.rfind('/').map(|i| i + 1).unwrap_or(0) => {
            path.split_at(idx)
        }
        _ => (path, ""),
    }
}

/// Builds the renamed path for a resurrected asset: `base_DELETED<ext>`.
/// Mirrors `pyosf/sync.py`'s `recreated_path`.
pub fn resurrected_path(path: &str) -> String {
    let (base, ext) = split_ext(path);
    format!("{base}_DELETED{ext}")
}

/// Builds the conflict-rename pair for a path edited on both sides.
/// Mirrors `pyosf/sync.py`'s `conflict_paths`. When the two timestamps are
/// exactly equal, a `_LOCAL`/`_REMOTE` tag breaks the tie so the two
/// generated names never collide.
pub fn conflict_paths(
    path: &str,
    local_time: DateTime<Utc>,
    remote_time: DateTime<Utc>,
) -> (String, String) {
    let (base, ext) = split_ext(path);
    if local_time == remote_time {
        (
            format!("{base}_CONFLICT{}_LOCAL{ext}", fmt_ts(local_time)),
            format!("{base}_CONFLICT{}_REMOTE{ext}", remote_time_fmt(remote_time)),
        )
    } else {
        (
            format!("{base}_CONFLICT{}{ext}", fmt_ts(local_time)),
            format!("{base}_CONFLICT{}{ext}", fmt_ts(remote_time)),
        )
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

fn remote_time_fmt(ts: DateTime<Utc>) -> String {
    fmt_ts(ts)
}

/// Returns the parent folder path of a normalized path, or `None` at the root.
pub fn parent_of(path: &str) -> Option<String> {
    match path.rfind('/') {
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Returns the leaf (final path segment) of a normalized path.
pub fn leaf_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
