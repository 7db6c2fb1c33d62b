//! Cache key conventions.
//!
//! Keys are flat strings with colon-delimited logical prefixes such as
//! `projects:all` or `deals:<pipeline-id>`. The store only matches keys exactly
//! or by prefix; these helpers keep callers consistent so that prefix
//! invalidation hits the whole family.

/// Separator between key segments.
pub const SEPARATOR: char = ':';

/// Join `namespace` and `segments` into a key.
///
/// ```
/// assert_eq!(pulsecache::cache::keys::key("deals", ["sales"]), "deals:sales");
/// ```
pub fn key<I, S>(namespace: &str, segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = namespace.to_string();
    for segment in segments {
        out.push(SEPARATOR);
        out.push_str(segment.as_ref());
    }
    out
}

/// Prefix matching every key under `namespace`, separator included, so that
/// `deals` never matches `dealsarchive:*`.
pub fn namespace_prefix(namespace: &str) -> String {
    let mut prefix = namespace.trim_end_matches(SEPARATOR).to_string();
    prefix.push(SEPARATOR);
    prefix
}

/// The leading segment of `key`, if it has more than one.
pub fn namespace_of(key: &str) -> Option<&str> {
    key.split_once(SEPARATOR).map(|(namespace, _)| namespace)
}
