//! URI helpers.

/// Joins `additional` onto `base` with exactly one `/` between them.
pub fn normalize_uri(base: &str, additional: &str) -> String {
    match (base.ends_with('/'), additional.starts_with('/')) {
        (true, true) => format!("{}{}", &base[..base.len() - 1], additional),
        (false, false) if !additional.is_empty() => format!("{base}/{additional}"),
        _ => format!("{base}{additional}"),
    }
}

/// Appends a percent-encoded query parameter.
pub fn with_query(uri: &str, key: &str, value: &str) -> String {
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{separator}{key}={}", urlencoding::encode(value))
}

/// Percent-encodes each segment of a relative path, keeping the separators.
pub fn escape_path(relative_path: &str) -> String {
    relative_path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
