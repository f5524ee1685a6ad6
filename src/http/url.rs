// src/http/url.rs

//! URL path and query decoding.

use crate::core::errors::ProxyError;
use indexmap::IndexMap;

/// Percent- and plus-decodes one URL component. Escapes must be a `%`
/// followed by exactly two hex digits and must decode to UTF-8.
pub fn decode_component(raw: &str) -> Result<String, ProxyError> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(ProxyError::Http(format!("invalid escape in '{raw}'")));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|_| ProxyError::Http(format!("'{raw}' does not decode to UTF-8")))
}

/// Parses `name=value&name=value`. A name without `=` gets an empty value;
/// later duplicates overwrite earlier ones.
pub fn parse_parameters(query: &str) -> Result<IndexMap<String, String>, ProxyError> {
    let mut parameters = IndexMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode_component(name)?;
        if name.is_empty() {
            continue;
        }
        parameters.insert(name, decode_component(value)?);
    }
    Ok(parameters)
}

/// Splits a request target into a decoded path and its parameters.
pub fn split_url(target: &str) -> Result<(String, IndexMap<String, String>), ProxyError> {
    let target = target.split_once('#').map_or(target, |(t, _)| t);
    match target.split_once('?') {
        Some((path, query)) => Ok((decode_component(path)?, parse_parameters(query)?)),
        None => Ok((decode_component(target)?, IndexMap::new())),
    }
}
