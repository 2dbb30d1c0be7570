//! Blocklist evaluation.
//!
//! `evaluate` is a pure function over the request facts, the process-wide
//! policy mode, and a blocklist snapshot: same inputs, same output. The
//! proxy engine owns snapshotting and fallback; nothing here does I/O.

/// Process-wide operating mode, read from the shared store on each decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// Every request that passes the blocklist is held for human review.
    Intercept,
    /// Non-interactive: the blocklist alone decides.
    Filter,
}

impl PolicyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intercept => "intercept",
            Self::Filter => "filter",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "intercept" => Some(Self::Intercept),
            "filter" => Some(Self::Filter),
            _ => None,
        }
    }
}

/// Ordered domain patterns and keyword substrings. Order is preserved for
/// first-match reporting, though the outcome never depends on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocklist {
    pub domains: Vec<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Block,
    Review,
}

impl PolicyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Review => "review",
        }
    }
}

/// The slices of a request the blocklist can see.
#[derive(Debug, Clone, Copy)]
pub struct RequestFacts<'a> {
    pub host: &'a str,
    pub path: &'a str,
    pub header_values: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
}

pub fn evaluate(facts: &RequestFacts<'_>, mode: PolicyMode, blocklist: &Blocklist) -> PolicyAction {
    if matched_domain(facts.host, &blocklist.domains).is_some() {
        return PolicyAction::Block;
    }
    if matched_keyword(facts, &blocklist.keywords).is_some() {
        return PolicyAction::Block;
    }
    match mode {
        PolicyMode::Filter => PolicyAction::Allow,
        PolicyMode::Intercept => PolicyAction::Review,
    }
}

/// First domain pattern matching `host`, insertion order. `*.example.com`
/// matches strict subdomains only; a bare pattern matches only itself;
/// IP-literal hosts match patterns literally.
pub fn matched_domain<'a>(host: &str, patterns: &'a [String]) -> Option<&'a str> {
    patterns
        .iter()
        .map(String::as_str)
        .find(|pattern| domain_matches(host, pattern))
}

fn domain_matches(host: &str, pattern: &str) -> bool {
    if let Some(parent) = pattern.strip_prefix("*.") {
        if host.len() <= parent.len() + 1 {
            return false;
        }
        let (subdomain, tail) = host.split_at(host.len() - parent.len() - 1);
        return !subdomain.is_empty()
            && tail.as_bytes()[0] == b'.'
            && tail[1..].eq_ignore_ascii_case(parent);
    }
    host.eq_ignore_ascii_case(pattern)
}

/// First keyword found in the path, any header value, or the body.
/// Case-insensitive, UTF-8 bytewise.
pub fn matched_keyword<'a>(
    facts: &RequestFacts<'_>,
    keywords: &'a [String],
) -> Option<&'a str> {
    keywords.iter().map(String::as_str).find(|keyword| {
        if keyword.is_empty() {
            return false;
        }
        contains_ignore_ascii_case(facts.path.as_bytes(), keyword.as_bytes())
            || facts
                .header_values
                .iter()
                .any(|(_, value)| contains_ignore_ascii_case(value.as_bytes(), keyword.as_bytes()))
            || contains_ignore_ascii_case(facts.body, keyword.as_bytes())
    })
}

fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::{
        evaluate, matched_domain, Blocklist, PolicyAction, PolicyMode, RequestFacts,
    };

    fn facts<'a>(host: &'a str, path: &'a str, body: &'a [u8]) -> RequestFacts<'a> {
        RequestFacts {
            host,
            path,
            header_values: &[],
            body,
        }
    }

    fn blocklist(domains: &[&str], keywords: &[&str]) -> Blocklist {
        Blocklist {
            domains: domains.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn wildcard_matches_strict_subdomains_only() {
        let patterns = vec!["*.bad.test".to_string()];
        assert_eq!(matched_domain("x.bad.test", &patterns), Some("*.bad.test"));
        assert_eq!(
            matched_domain("deep.x.bad.test", &patterns),
            Some("*.bad.test")
        );
        assert_eq!(matched_domain("bad.test", &patterns), None);
        assert_eq!(matched_domain("notbad.test", &patterns), None);
    }

    #[test]
    fn bare_pattern_matches_only_itself() {
        let patterns = vec!["example.com".to_string()];
        assert_eq!(matched_domain("example.com", &patterns), Some("example.com"));
        assert_eq!(matched_domain("EXAMPLE.COM", &patterns), Some("example.com"));
        assert_eq!(matched_domain("www.example.com", &patterns), None);
    }

    #[test]
    fn ip_literal_matches_literally() {
        let patterns = vec!["10.0.0.1".to_string(), "*.0.0.1".to_string()];
        assert_eq!(matched_domain("10.0.0.1", &patterns), Some("10.0.0.1"));
        assert_eq!(matched_domain("192.168.0.1", &patterns), None);
    }

    #[test]
    fn keyword_scan_covers_path_headers_and_body() {
        let list = blocklist(&[], &["secret"]);
        assert_eq!(
            evaluate(
                &facts("ok.test", "/path?q=SECRET", b""),
                PolicyMode::Filter,
                &list
            ),
            PolicyAction::Block
        );
        assert_eq!(
            evaluate(
                &RequestFacts {
                    host: "ok.test",
                    path: "/",
                    header_values: &[("X-Token", "my-Secret-token")],
                    body: b"",
                },
                PolicyMode::Filter,
                &list
            ),
            PolicyAction::Block
        );
        assert_eq!(
            evaluate(
                &facts("ok.test", "/", b"payload with secret inside"),
                PolicyMode::Filter,
                &list
            ),
            PolicyAction::Block
        );
        assert_eq!(
            evaluate(&facts("ok.test", "/clean", b"clean"), PolicyMode::Filter, &list),
            PolicyAction::Allow
        );
    }

    #[test]
    fn empty_blocklists_never_match() {
        let list = Blocklist::default();
        assert_eq!(
            evaluate(&facts("any.test", "/", b""), PolicyMode::Filter, &list),
            PolicyAction::Allow
        );
        assert_eq!(
            evaluate(&facts("any.test", "/", b""), PolicyMode::Intercept, &list),
            PolicyAction::Review
        );
    }

    #[test]
    fn intercept_mode_blocks_before_review() {
        let list = blocklist(&["*.bad.test"], &[]);
        assert_eq!(
            evaluate(&facts("x.bad.test", "/", b""), PolicyMode::Intercept, &list),
            PolicyAction::Block
        );
        assert_eq!(
            evaluate(&facts("good.test", "/", b""), PolicyMode::Intercept, &list),
            PolicyAction::Review
        );
    }

    #[test]
    fn evaluate_is_pure() {
        let list = blocklist(&["*.bad.test"], &["secret"]);
        let input = facts("host.test", "/q", b"body");
        let first = evaluate(&input, PolicyMode::Intercept, &list);
        let second = evaluate(&input, PolicyMode::Intercept, &list);
        assert_eq!(first, second);
    }
}
