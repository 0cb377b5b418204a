use axum::http::Method;

/// How the proxy treats an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// CORS preflight, answered at the edge
    Preflight,
    /// GET under a cacheable prefix
    CacheableGet,
    /// Forwarded to origin without touching the cache
    PassThrough,
}

impl RequestClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestClass::Preflight => "preflight",
            RequestClass::CacheableGet => "cacheable",
            RequestClass::PassThrough => "pass_through",
        }
    }
}

/// Static set of path prefixes eligible for caching.
#[derive(Debug, Clone, Default)]
pub struct CacheableRule {
    prefixes: Vec<String>,
}

impl CacheableRule {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Classify a request. Total over every method and path.
    pub fn classify(&self, method: &Method, path: &str) -> RequestClass {
        if method == Method::OPTIONS {
            RequestClass::Preflight
        } else if method == Method::GET && self.matches(path) {
            RequestClass::CacheableGet
        } else {
            RequestClass::PassThrough
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_rule() -> CacheableRule {
        CacheableRule::new(["/api/news", "/api/statistics", "/api/health"])
    }

    #[test]
    fn test_options_is_always_preflight() {
        let rule = default_rule();

        for path in ["/", "/api/news", "/api/articles/7", "/anything/else"] {
            assert_eq!(rule.classify(&Method::OPTIONS, path), RequestClass::Preflight);
        }
    }

    #[test]
    fn test_get_under_prefix_is_cacheable() {
        let rule = default_rule();

        assert_eq!(rule.classify(&Method::GET, "/api/news"), RequestClass::CacheableGet);
        assert_eq!(
            rule.classify(&Method::GET, "/api/news/latest/5"),
            RequestClass::CacheableGet
        );
        assert_eq!(
            rule.classify(&Method::GET, "/api/statistics/daily"),
            RequestClass::CacheableGet
        );
        assert_eq!(rule.classify(&Method::GET, "/api/health"), RequestClass::CacheableGet);
    }

    #[test]
    fn test_other_requests_pass_through() {
        let rule = default_rule();

        assert_eq!(rule.classify(&Method::GET, "/api/articles"), RequestClass::PassThrough);
        assert_eq!(rule.classify(&Method::GET, "/"), RequestClass::PassThrough);
        assert_eq!(rule.classify(&Method::POST, "/api/news"), RequestClass::PassThrough);
        assert_eq!(rule.classify(&Method::PUT, "/api/health"), RequestClass::PassThrough);
        assert_eq!(rule.classify(&Method::DELETE, "/api/news/1"), RequestClass::PassThrough);
        assert_eq!(rule.classify(&Method::HEAD, "/api/news"), RequestClass::PassThrough);
    }

    #[test]
    fn test_empty_rule_caches_nothing() {
        let rule = CacheableRule::default();

        assert!(rule.prefixes().is_empty());
        assert_eq!(rule.classify(&Method::GET, "/api/news"), RequestClass::PassThrough);
        assert_eq!(rule.classify(&Method::OPTIONS, "/api/news"), RequestClass::Preflight);
    }
}
