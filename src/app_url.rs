use std::collections::HashMap;

const API_URL_KEY: &str = "PANEL_API_URL";
const DOMAIN_KEY: &str = "DOMAIN";
const LOCAL_DOMAIN_PREFIXES: [&str; 3] = ["localhost", "127.0.0.1", "[::1]"];

fn is_local_domain(value: &str) -> bool {
    let lower = value.to_lowercase();
    LOCAL_DOMAIN_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Accepts a bare host (optionally with a port), nothing else.
pub fn normalize_domain(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("://") || trimmed.contains('/') || trimmed.contains('?') || trimmed.contains('#')
    {
        return None;
    }
    let (host, port) = split_host_port(trimmed)?;
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    let host_chars_ok = if host.starts_with('[') {
        host.chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '[' || c == ']')
    } else {
        host.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    };
    if host.is_empty() || !host_chars_ok {
        return None;
    }
    Some(trimmed.to_string())
}

fn split_host_port(value: &str) -> Option<(&str, Option<&str>)> {
    if value.starts_with('[') {
        let end = value.find(']')?;
        let (host, rest) = value.split_at(end + 1);
        if rest.is_empty() {
            return Some((host, None));
        }
        return rest.strip_prefix(':').map(|port| (host, Some(port)));
    }
    match value.split_once(':') {
        Some((host, port)) => Some((host, Some(port))),
        None => Some((value, None)),
    }
}

/// Accepts an absolute http(s) URL and strips trailing slashes.
pub fn normalize_api_url(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))?;
    if rest.is_empty() || rest.starts_with('/') {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn resolve_api_base_url(settings: &HashMap<String, String>) -> Option<String> {
    if let Some(url) = normalize_api_url(settings.get(API_URL_KEY).map(String::as_str)) {
        return Some(url);
    }
    let domain = normalize_domain(settings.get(DOMAIN_KEY).map(String::as_str))?;
    let scheme = if is_local_domain(&domain) {
        "http"
    } else {
        "https"
    };
    Some(format!("{}://{}/api", scheme, domain))
}
