//! Host reversal and domain normalization.
//!
//! `host_rev` is the host with its labels reversed and joined by commas:
//! `www.example.com` becomes `com,example,www`. The comma keeps label
//! boundaries visible, so a prefix match on `com,example` plus `,` captures
//! exactly the subdomain tree of `example.com` and nothing that merely shares
//! a string prefix (`com,example2` does not match `com,example,%`).
use url::Url;

/// Reverse a bare host into its `host_rev` form.
///
/// The input is lowercased, empty labels are dropped (so a trailing dot is
/// harmless), and `www.` is preserved.
pub fn host_to_rev(host: &str) -> String {
    let lower = host.to_lowercase();
    let mut labels: Vec<&str> = lower.split('.').filter(|p| !p.is_empty()).collect();
    labels.reverse();
    labels.join(",")
}

/// `host_rev` back to the usual dotted host, for display.
pub fn rev_to_host(host_rev: &str) -> String {
    let mut labels: Vec<&str> = host_rev.split(',').filter(|p| !p.is_empty()).collect();
    labels.reverse();
    labels.join(".")
}

/// Derive `host_rev` from a captured URL. Returns `None` when no host can be
/// extracted.
pub fn host_rev_from_url(url: &str) -> Option<String> {
    let host = match Url::parse(url) {
        Ok(u) => u.host_str().map(|h| h.to_string()),
        // CDX lines occasionally carry schemeless URLs.
        Err(_) => Url::parse(&format!("http://{}", url))
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string())),
    }?;
    let host = host.trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    Some(host_to_rev(host))
}

/// Normalize user input (domain or URL) to a bare host.
///
/// Lowercases and strips scheme, userinfo, port and path. A leading `www.` is
/// removed only when `bare` is set; the default keeps it so that subdomain
/// semantics stay intact.
pub fn normalize_domain(input: &str, bare: bool) -> String {
    let mut dom = input.trim().to_lowercase();
    if let Some(pos) = dom.find("://") {
        dom = dom[pos + 3..].to_string();
    }
    if let Some(pos) = dom.find('/') {
        dom.truncate(pos);
    }
    if let Some(pos) = dom.rfind('@') {
        dom = dom[pos + 1..].to_string();
    }
    if let Some(pos) = dom.find(':') {
        dom.truncate(pos);
    }
    if bare {
        if let Some(stripped) = dom.strip_prefix("www.") {
            dom = stripped.to_string();
        }
    }
    dom.trim_matches('.').to_string()
}

/// The `LIKE` pattern matching every subdomain of `host_rev` (the host itself
/// is matched with equality).
pub fn subdomain_like_pattern(host_rev: &str) -> String {
    format!("{},%", host_rev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverses_labels() {
        assert_eq!(host_to_rev("example.com"), "com,example");
        assert_eq!(host_to_rev("www.Example.COM"), "com,example,www");
        assert_eq!(host_to_rev("example.com."), "com,example");
    }

    #[test]
    fn round_trips() {
        assert_eq!(rev_to_host("com,example,www"), "www.example.com");
    }

    #[test]
    fn from_url_variants() {
        assert_eq!(
            host_rev_from_url("https://www.example.com/a?b=c"),
            Some("com,example,www".to_string())
        );
        assert_eq!(
            host_rev_from_url("http://user:pw@api.example.org:8080/x"),
            Some("org,example,api".to_string())
        );
        assert_eq!(
            host_rev_from_url("example.com/path"),
            Some("com,example".to_string())
        );
        assert_eq!(host_rev_from_url("not a url"), None);
    }

    #[test]
    fn normalization_modes() {
        assert_eq!(
            normalize_domain("HTTPS://WWW.Example.com:443/a/b", false),
            "www.example.com"
        );
        assert_eq!(
            normalize_domain("https://www.example.com/a", true),
            "example.com"
        );
        assert_eq!(normalize_domain("ca.gov", false), "ca.gov");
    }

    #[test]
    fn like_pattern_excludes_sibling_hosts() {
        // "gov,ca,%" must not match "gov,california".
        let pat = subdomain_like_pattern("gov,ca");
        assert_eq!(pat, "gov,ca,%");
        assert!("gov,ca,dmv".starts_with("gov,ca,"));
        assert!(!"gov,california".starts_with("gov,ca,"));
    }
}
