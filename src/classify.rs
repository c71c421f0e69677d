//! Pure functions that turn an endpoint path into the bits the rate limiter and health
//! gate need: which rate-limit group it falls into, whether it's subject to the
//! contract-items burst window, and which base route covers it in a health snapshot.

/// Maps an endpoint to the rate-limit group used as the key into per-group state. This
/// must match the server's own `X-Ratelimit-Group` header values exactly — state is
/// written under the header's group name (`update_from_headers`) and read back under
/// `classify`'s. Order matters: first match wins, all checks are case-sensitive
/// substring checks on the path.
pub fn classify(endpoint: &str) -> &'static str {
    let path = endpoint.split('?').next().unwrap_or(endpoint);

    if path.contains("/characters/") && path.contains("/assets") {
        "char-asset"
    } else if path.contains("/corporations/") && path.contains("/assets") {
        "corp-asset"
    } else if path.contains("/characters/") && path.contains("/wallet") {
        "char-wallet"
    } else if path.contains("/corporations/") && path.contains("/wallet") {
        "corp-wallet"
    } else if path.contains("/characters/") && (path.contains("/industry") || path.contains("/blueprints")) {
        "char-industry"
    } else if path.contains("/corporations/") && (path.contains("/industry") || path.contains("/blueprints")) {
        "corp-industry"
    } else if path.contains("/characters/") && path.contains("/contracts") {
        "char-contract"
    } else if path.contains("/corporations/") && path.contains("/contracts") {
        "corp-contract"
    } else if path.contains("/characters/") && path.contains("/clones") {
        "char-location"
    } else if path.contains("/characters/") && path.contains("/implants") {
        "char-detail"
    } else if path.contains("/corporations/") && (path.contains("/starbases") || path.contains("/structures")) {
        "corp-structure"
    } else if path.contains("/markets/") {
        "market"
    } else if path.contains("/universe/") {
        "universe"
    } else {
        "default"
    }
}

/// True for `/characters/{id}/contracts/{id}/items` and the corporation equivalent —
/// the one endpoint family with its own 10-second burst window, independent of the
/// header-driven per-group limiter.
pub fn is_contract_items(endpoint: &str) -> bool {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        [root, id1, "contracts", id2, "items"] => {
            (*root == "characters" || *root == "corporations")
                && id1.parse::<u64>().is_ok()
                && id2.parse::<u64>().is_ok()
        }
        _ => false,
    }
}

/// Extracts the first path segment as `/segment/`, which is how health-snapshot routes
/// are keyed against endpoints. Endpoints with no segments fall back to `/`.
pub fn extract_base(endpoint: &str) -> String {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    match path.trim_start_matches('/').split('/').next() {
        Some(seg) if !seg.is_empty() => format!("/{seg}/"),
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_the_rule_table_in_order() {
        assert_eq!(classify("/characters/1/assets/"), "char-asset");
        assert_eq!(classify("/corporations/2/assets/"), "corp-asset");
        assert_eq!(classify("/characters/1/wallet/journal/"), "char-wallet");
        assert_eq!(classify("/corporations/2/wallet/journal/"), "corp-wallet");
        assert_eq!(classify("/characters/1/industry/jobs/"), "char-industry");
        assert_eq!(classify("/characters/1/blueprints/"), "char-industry");
        assert_eq!(classify("/corporations/2/industry/jobs/"), "corp-industry");
        assert_eq!(classify("/corporations/2/blueprints/"), "corp-industry");
        assert_eq!(classify("/characters/1/contracts/2/items/"), "char-contract");
        assert_eq!(classify("/corporations/2/contracts/3/items/"), "corp-contract");
        assert_eq!(classify("/characters/1/clones/"), "char-location");
        assert_eq!(classify("/characters/1/implants/"), "char-detail");
        assert_eq!(classify("/corporations/2/starbases/"), "corp-structure");
        assert_eq!(classify("/corporations/2/structures/"), "corp-structure");
        assert_eq!(classify("/markets/10000002/orders/"), "market");
        assert_eq!(classify("/universe/types/1/"), "universe");
        assert_eq!(classify("/status/"), "default");
    }

    #[test]
    fn contract_items_matches_exact_shape_only() {
        assert!(is_contract_items("/characters/1/contracts/2/items/"));
        assert!(is_contract_items("/corporations/1/contracts/2/items"));
        assert!(!is_contract_items("/characters/1/contracts/2/"));
        assert!(!is_contract_items("/characters/1/contracts/abc/items/"));
        assert!(!is_contract_items("/alliances/1/contracts/2/items/"));
    }

    #[test]
    fn extract_base_takes_first_segment() {
        assert_eq!(extract_base("/characters/1/assets/?page=2"), "/characters/");
        assert_eq!(extract_base("/"), "/");
        assert_eq!(extract_base(""), "/");
    }
}
