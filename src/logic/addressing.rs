use crate::config::AddressingConfig;
use crate::model::CoreError;

/// Returns `raw` unchanged when it already carries an absolute http(s)
/// scheme, otherwise qualifies it with the configured base and user prefix.
/// Idempotent by construction.
pub fn normalize_global_id(raw: &str, cfg: &AddressingConfig) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    format!("{}/{}/{}", cfg.base_uri_prefix, cfg.user_prefix, raw)
}

/// `{normalized_global}/{asset_id}/{element_id}`.
pub fn build_fullpath(
    global_id: &str,
    asset_id: &str,
    element_id: &str,
    cfg: &AddressingConfig,
) -> String {
    format!(
        "{}/{}/{}",
        normalize_global_id(global_id, cfg),
        asset_id,
        element_id
    )
}

/// Splits a fullpath back into (global_asset_id, asset_id, element_id). The
/// global part keeps its full URI form; the last two path segments are the
/// asset and element ids.
pub fn parse_fullpath(uri: &str) -> Result<(String, String, String), CoreError> {
    let after_scheme = uri
        .strip_prefix("https://")
        .or_else(|| uri.strip_prefix("http://"))
        .ok_or_else(|| CoreError::Malformed(format!("missing scheme: '{}'", uri)))?;

    // Need host plus at least two path segments beyond the global part.
    let mut parts = uri.rsplitn(3, '/');
    let element_id = parts.next().unwrap_or_default();
    let asset_id = parts.next().unwrap_or_default();
    let global = parts.next().unwrap_or_default();

    if element_id.is_empty() || asset_id.is_empty() || global.is_empty() {
        return Err(CoreError::Malformed(format!(
            "expected <global>/<asset>/<element>: '{}'",
            uri
        )));
    }
    // The global part must still contain a path segment after the host,
    // otherwise the uri had fewer than two segments to spare.
    if !after_scheme.contains('/') || !global.contains("://") {
        return Err(CoreError::Malformed(format!(
            "global part lost its scheme: '{}'",
            uri
        )));
    }

    Ok((
        global.to_string(),
        asset_id.to_string(),
        element_id.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AddressingConfig {
        AddressingConfig::default()
    }

    #[test]
    fn bare_ids_are_qualified() {
        assert_eq!(
            normalize_global_id("g1", &cfg()),
            "https://digital-thread.re/kitech/g1"
        );
    }

    #[test]
    fn absolute_uris_pass_through() {
        let uri = "http://example.org/acme/g1";
        assert_eq!(normalize_global_id(uri, &cfg()), uri);
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_global_id("g1", &cfg());
        assert_eq!(normalize_global_id(&once, &cfg()), once);
    }

    #[test]
    fn fullpath_round_trips() {
        let cfg = cfg();
        let uri = build_fullpath("g1", "prj-1", "elem-9", &cfg);
        let (g, a, e) = parse_fullpath(&uri).unwrap();
        assert_eq!(g, normalize_global_id("g1", &cfg));
        assert_eq!(a, "prj-1");
        assert_eq!(e, "elem-9");
    }

    #[test]
    fn too_few_segments_is_malformed() {
        assert!(matches!(
            parse_fullpath("https://digital-thread.re/kitech"),
            Err(CoreError::Malformed(_))
        ));
        assert!(matches!(
            parse_fullpath("not-a-uri"),
            Err(CoreError::Malformed(_))
        ));
    }
}
