//! Domain name helpers shared by the rule store, resolvers and engine.

use glob::{MatchOptions, Pattern};
use hickory_proto::op::Message;

/// Lower-cases a domain and strips the trailing dot, producing the form
/// used for rule matching and cache keys.
pub fn canonicalize(domain: &str) -> String {
    let mut name = domain.trim().to_ascii_lowercase();
    if name.ends_with('.') {
        name.pop();
    }
    name
}

/// The domain fan-out: the name itself plus every parent obtained by
/// trimming leftmost labels. `a.b.c` yields `[a.b.c, b.c, c]`.
pub fn domain_list(domain: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut part = domain;
    loop {
        out.push(part);
        match part.find('.') {
            Some(idx) if idx + 1 < part.len() => part = &part[idx + 1..],
            _ => break,
        }
    }
    out
}

/// True when the response carries no usable answer records.
pub fn is_empty_response(response: &Message) -> bool {
    response.answers().is_empty()
}

/// Shell-style glob match anchored at the whole name, case-insensitive.
/// Used for resolver `domains` scoping (e.g. `*.lan`).
pub fn glob_matches(pattern: &str, domain: &str) -> bool {
    const OPTS: MatchOptions = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(domain, OPTS),
        Err(_) => false,
    }
}

/// A name with at most one label, e.g. `myhost` or `myhost.`. Candidates
/// for search-suffix expansion.
pub fn is_single_label(domain: &str) -> bool {
    !domain.trim_end_matches('.').contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("FoO.ExAmple."), "foo.example");
        assert_eq!(canonicalize("plain"), "plain");
        assert_eq!(canonicalize(" spaced.example "), "spaced.example");
    }

    #[test]
    fn test_domain_list_fan_out() {
        assert_eq!(domain_list("a.b.c"), vec!["a.b.c", "b.c", "c"]);
        assert_eq!(domain_list("example"), vec!["example"]);
        assert_eq!(
            domain_list("deep.sub.ads.example.com"),
            vec![
                "deep.sub.ads.example.com",
                "sub.ads.example.com",
                "ads.example.com",
                "example.com",
                "com"
            ]
        );
    }

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("*.lan", "printer.lan"));
        assert!(glob_matches("*.lan", "PRINTER.LAN"));
        assert!(!glob_matches("*.lan", "printer.home"));
        assert!(glob_matches("exact.example", "exact.example"));
    }

    #[test]
    fn test_single_label() {
        assert!(is_single_label("myhost"));
        assert!(is_single_label("myhost."));
        assert!(!is_single_label("my.host"));
    }
}
