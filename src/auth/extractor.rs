//! Credential extraction — the first step of inbound auth.
//!
//! Four sources, checked in a fixed priority order so a request carrying
//! more than one never has ambiguous precedence: `Authorization: Bearer`,
//! `x-api-key`, `x-goog-api-key`, and a `?token=` query parameter for
//! WebSocket/SSE clients that can't set headers.

use std::collections::HashMap;

/// Extracts a raw credential string from request headers/query
/// parameters. Header lookups are case-insensitive; callers may pass
/// either already-lowercased keys or the original casing.
pub fn extract_credential(headers: &HashMap<String, String>, query: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = header_ci(headers, "authorization") {
        if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) {
            let trimmed = token.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    if let Some(value) = header_ci(headers, "x-api-key") {
        if !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    if let Some(value) = header_ci(headers, "x-goog-api-key") {
        if !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    if let Some(token) = query.get("token") {
        if !token.trim().is_empty() {
            return Some(token.trim().to_string());
        }
    }
    None
}

fn header_ci<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn bearer_token_takes_priority_over_api_key() {
        let h = headers(&[("Authorization", "Bearer sk-abc"), ("x-api-key", "other")]);
        assert_eq!(extract_credential(&h, &HashMap::new()), Some("sk-abc".to_string()));
    }

    #[test]
    fn falls_back_to_x_api_key() {
        let h = headers(&[("x-api-key", "sk-xyz")]);
        assert_eq!(extract_credential(&h, &HashMap::new()), Some("sk-xyz".to_string()));
    }

    #[test]
    fn falls_back_to_goog_header_then_query_token() {
        let h = headers(&[("x-goog-api-key", "goog-key")]);
        assert_eq!(extract_credential(&h, &HashMap::new()), Some("goog-key".to_string()));

        let query: HashMap<String, String> = [("token".to_string(), "ws-token".to_string())].into();
        assert_eq!(extract_credential(&HashMap::new(), &query), Some("ws-token".to_string()));
    }

    #[test]
    fn no_credential_present_returns_none() {
        assert_eq!(extract_credential(&HashMap::new(), &HashMap::new()), None);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let h = headers(&[("X-API-KEY", "sk-case")]);
        assert_eq!(extract_credential(&h, &HashMap::new()), Some("sk-case".to_string()));
    }
}
