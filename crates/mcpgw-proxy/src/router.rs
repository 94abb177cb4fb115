//! Name-prefix request routing.
//!
//! The first path segment selects a backend; the rest of the path (prefix
//! stripped by default) travels on to the reverse proxy with the query
//! string preserved. Registered names may contain `*`, matched glob-style
//! against the first segment when wildcards are enabled.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::Request;
use axum::http::Uri;
use axum::response::Response;
use regex::Regex;
use tracing::debug;

use mcpgw_core::BackendDescriptor;

use crate::forward::ReverseProxy;

/// Routing knobs.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Drop the backend name from the forwarded path.
    pub strip_server_prefix: bool,
    /// Compare names verbatim; when false, lookups are lowered.
    pub case_sensitive: bool,
    /// Allow `*` in registered names, matched as a glob.
    pub enable_wildcards: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strip_server_prefix: true,
            case_sensitive: true,
            enable_wildcards: true,
        }
    }
}

/// `name -> descriptor` map plus the delegation to the reverse proxy.
pub struct RequestRouter {
    servers: RwLock<HashMap<String, BackendDescriptor>>,
    config: RouterConfig,
    proxy: Arc<ReverseProxy>,
}

impl RequestRouter {
    pub fn new(config: RouterConfig, proxy: Arc<ReverseProxy>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            config,
            proxy,
        }
    }

    pub fn register(&self, descriptor: BackendDescriptor) {
        debug!(server = %descriptor.name, "Registering route");
        self.servers
            .write()
            .unwrap()
            .insert(descriptor.name.clone(), descriptor);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.servers.write().unwrap().remove(name).is_some()
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.servers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptor(&self, name: &str) -> Option<BackendDescriptor> {
        self.servers.read().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().unwrap().is_empty()
    }

    /// Match the request against the registered names and forward it.
    ///
    /// Returns `None` when no backend matches; the caller answers 404.
    /// The proxy has already produced the HTTP response in the `Some`
    /// case, including failure mapping.
    pub async fn route_request(&self, mut req: Request) -> Option<Response> {
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let first = *segments.first()?;

        let descriptor = self.lookup(first)?;

        let target_path = if self.config.strip_server_prefix {
            let rest = segments[1..].join("/");
            format!("/{rest}")
        } else {
            path.clone()
        };
        let target = match req.uri().query() {
            Some(query) => format!("{target_path}?{query}"),
            None => target_path,
        };
        let uri: Uri = target.parse().ok()?;
        *req.uri_mut() = uri;

        debug!(server = %descriptor.name, target = %req.uri(), "Routing request");
        Some(self.proxy.forward(&descriptor, req).await)
    }

    fn lookup(&self, segment: &str) -> Option<BackendDescriptor> {
        let servers = self.servers.read().unwrap();

        if let Some(descriptor) = servers.get(segment) {
            return Some(descriptor.clone());
        }
        if !self.config.case_sensitive {
            let lowered = segment.to_lowercase();
            if let Some(descriptor) = servers
                .iter()
                .find(|(name, _)| name.to_lowercase() == lowered)
                .map(|(_, d)| d)
            {
                return Some(descriptor.clone());
            }
        }
        if self.config.enable_wildcards {
            // Sorted walk keeps wildcard resolution deterministic.
            let mut patterns: Vec<&String> =
                servers.keys().filter(|name| name.contains('*')).collect();
            patterns.sort();
            for pattern in patterns {
                if glob_match(pattern, segment, self.config.case_sensitive) {
                    return servers.get(pattern).cloned();
                }
            }
        }
        None
    }
}

/// Glob-style match where `*` spans any run of characters.
fn glob_match(pattern: &str, candidate: &str, case_sensitive: bool) -> bool {
    let mut regex = String::from("^");
    if !case_sensitive {
        regex.insert_str(0, "(?i)");
    }
    for (i, part) in pattern.split('*').enumerate() {
        if i > 0 {
            regex.push_str(".*");
        }
        regex.push_str(&regex::escape(part));
    }
    regex.push('$');
    Regex::new(&regex).is_ok_and(|re| re.is_match(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_spans_characters() {
        assert!(glob_match("mem*", "memcache", true));
        assert!(glob_match("*-dev", "api-dev", true));
        assert!(glob_match("a*c", "abc", true));
        assert!(!glob_match("mem*", "cache", true));
        assert!(glob_match("plain", "plain", true));
        assert!(!glob_match("plain", "PLAIN", true));
        assert!(glob_match("plain", "PLAIN", false));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        assert!(glob_match("a.b*", "a.bc", true));
        assert!(!glob_match("a.b*", "axbc", true));
    }
}
