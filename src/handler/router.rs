//! C9 — the `Router` contract named in §1 as an external collaborator
//! ("method+path → deferred response"); [`PatternRouter`] is the concrete
//! O(n) precedence matcher §4.7 describes, used as
//! [`super::HandlerContainer`]'s default and swappable via
//! [`super::HandlerContainer::with_router`].

use parking_lot::RwLock;

/// Resolves a request to the name of the handler that should serve it.
pub trait Router: Send + Sync {
    fn route(&self, method: &http::Method, path: &str) -> Option<String>;

    /// Registers a pattern-to-handler mapping. Default no-op, since a
    /// caller supplying a custom `Router` via
    /// [`super::HandlerContainer::with_router`] likely wires its routes up
    /// some other way than [`super::HandlerContainer::register_sync`]'s
    /// `patterns` argument.
    fn register(&self, _pattern: &str, _handler_name: &str) {}
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Wildcard,
}

fn parse_pattern(pattern: &str) -> Pattern {
    if pattern == "*" {
        Pattern::Wildcard
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        Pattern::Prefix(prefix.to_string())
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        Pattern::Suffix(suffix.to_string())
    } else {
        Pattern::Exact(pattern.to_string())
    }
}

/// §4.7's matcher: exact, then prefix (`"prefix*"`), then suffix
/// (`"*.ext"`), then wildcard (`"*"`). Method is accepted for the trait's
/// sake but unused here — every registered pattern matches any method,
/// matching spec.md's silence on method-scoped routes.
#[derive(Default)]
pub struct PatternRouter {
    entries: RwLock<Vec<(Pattern, String)>>,
}

impl PatternRouter {
    pub fn new() -> Self {
        PatternRouter {
            entries: RwLock::new(Vec::new()),
        }
    }

}

impl Router for PatternRouter {
    fn register(&self, pattern: &str, handler_name: &str) {
        self.entries
            .write()
            .push((parse_pattern(pattern), handler_name.to_string()));
    }

    fn route(&self, _method: &http::Method, path: &str) -> Option<String> {
        let entries = self.entries.read();

        for (pattern, name) in entries.iter() {
            if let Pattern::Exact(exact) = pattern {
                if exact == path {
                    return Some(name.clone());
                }
            }
        }
        for (pattern, name) in entries.iter() {
            if let Pattern::Prefix(prefix) = pattern {
                if path.starts_with(prefix.as_str()) {
                    return Some(name.clone());
                }
            }
        }
        for (pattern, name) in entries.iter() {
            if let Pattern::Suffix(suffix) = pattern {
                if path.ends_with(suffix.as_str()) {
                    return Some(name.clone());
                }
            }
        }
        for (pattern, name) in entries.iter() {
            if let Pattern::Wildcard = pattern {
                return Some(name.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_beats_prefix_beats_suffix_beats_wildcard() {
        let router = PatternRouter::new();
        router.register("*", "catch_all");
        router.register("*.css", "assets");
        router.register("/api/*", "api");
        router.register("/api/widgets", "widgets");

        assert_eq!(
            router.route(&http::Method::GET, "/api/widgets"),
            Some("widgets".to_string())
        );
        assert_eq!(
            router.route(&http::Method::GET, "/api/other"),
            Some("api".to_string())
        );
        assert_eq!(
            router.route(&http::Method::GET, "/style.css"),
            Some("assets".to_string())
        );
        assert_eq!(
            router.route(&http::Method::GET, "/nothing/matches/specifically"),
            Some("catch_all".to_string())
        );
    }

    #[test]
    fn no_match_returns_none_without_wildcard() {
        let router = PatternRouter::new();
        router.register("/health", "health");
        assert_eq!(router.route(&http::Method::GET, "/other"), None);
    }
}
