use std::borrow::Cow;

/// The database URL as it may appear in logs.
///
/// SQLite URLs carry no credentials, but query parameters can hold pragma
/// values such as encryption keys, so only their names are kept.
pub fn sanitize_database_url(raw: &str) -> Cow<'_, str> {
    let Some((base, query)) = raw.split_once('?') else {
        return Cow::Borrowed(raw);
    };
    let names: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').map_or(pair, |(name, _)| name))
        .collect();
    Cow::Owned(format!("{base}?{}", names.join("&")))
}
