//! Mapping from a client's opaque token to the backend it should reach.

use std::collections::BTreeMap;

use crate::protocol::HttpRequest;

/// Looks up the backend URL for a client token.
pub trait TargetResolver {
    /// Backend URL for `token`, or `None` if the token is unknown.
    fn resolve(&self, token: &str) -> Option<String>;
}

impl<F> TargetResolver for F
where
    F: Fn(&str) -> Option<String>,
{
    fn resolve(&self, token: &str) -> Option<String> {
        self(token)
    }
}

/// Fixed token table, usually loaded from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticTargets {
    targets: BTreeMap<String, String>,
}

impl StaticTargets {
    /// Wrap an existing table.
    pub fn new(targets: BTreeMap<String, String>) -> Self {
        Self { targets }
    }

    /// Add or replace a target.
    pub fn insert(&mut self, token: impl Into<String>, url: impl Into<String>) {
        self.targets.insert(token.into(), url.into());
    }

    /// Number of known tokens.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl TargetResolver for StaticTargets {
    fn resolve(&self, token: &str) -> Option<String> {
        self.targets.get(token).cloned()
    }
}

/// The token identifying which backend a client wants.
///
/// Taken from the `token` query parameter; browsers that cannot set it
/// identify themselves through `User-Agent` instead.
pub fn target_token(request: &HttpRequest) -> Option<&str> {
    request
        .query_param("token")
        .filter(|token| !token.is_empty())
        .or_else(|| request.header("user-agent"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, user_agent: Option<&str>) -> HttpRequest {
        let mut raw = format!("GET {path} HTTP/1.1\r\nHost: x\r\n");
        if let Some(agent) = user_agent {
            raw.push_str(&format!("User-Agent: {agent}\r\n"));
        }
        raw.push_str("\r\n");
        HttpRequest::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_static_targets_resolve() {
        let mut targets = StaticTargets::default();
        targets.insert("579484fa", "ws://docker:2375/attach/ws");
        assert_eq!(targets.len(), 1);
        assert_eq!(
            targets.resolve("579484fa").as_deref(),
            Some("ws://docker:2375/attach/ws")
        );
        assert_eq!(targets.resolve("unknown"), None);
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |token: &str| (token == "a").then(|| "tcp://127.0.0.1:1".to_string());
        assert!(resolver.resolve("a").is_some());
        assert!(resolver.resolve("b").is_none());
    }

    #[test]
    fn test_token_prefers_query_parameter() {
        let req = request("/console?token=abc", Some("agent-id"));
        assert_eq!(target_token(&req), Some("abc"));
    }

    #[test]
    fn test_token_falls_back_to_user_agent() {
        assert_eq!(target_token(&request("/", Some("agent-id"))), Some("agent-id"));
        assert_eq!(target_token(&request("/?token=", Some("agent-id"))), Some("agent-id"));
        assert_eq!(target_token(&request("/", None)), None);
    }
}
