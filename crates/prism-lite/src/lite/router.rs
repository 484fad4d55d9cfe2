use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use regex::Regex;

use crate::lite::config::Route;

/// A route selected for a host, with backends already parameterized from the captures.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    /// The host pattern that matched; used as the route id.
    pub pattern: String,
    pub captures: Vec<String>,
    pub backends: Vec<String>,
}

/// Ordered routing table. Routes are swapped atomically on reload; compiled patterns are
/// kept for the lifetime of the router.
#[derive(Debug)]
pub struct Router {
    routes: ArcSwap<Vec<Arc<Route>>>,
    compiled: DashMap<String, Option<Regex>>,
}

impl Router {
    pub fn new(routes: Vec<Route>) -> Self {
        let r = Self {
            routes: ArcSwap::from_pointee(Vec::new()),
            compiled: DashMap::new(),
        };
        r.update(routes);
        r
    }

    pub fn update(&self, routes: Vec<Route>) {
        self.routes
            .store(Arc::new(routes.into_iter().map(Arc::new).collect()));
    }

    pub fn routes(&self) -> Arc<Vec<Arc<Route>>> {
        self.routes.load_full()
    }

    /// First route (in declared order) with a pattern (in declared order) matching `host`.
    pub fn find_route(&self, host: &str) -> Option<RouteMatch> {
        let host = host.trim().to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        let routes = self.routes.load();
        for route in routes.iter() {
            for pattern in &route.hosts {
                let Some(captures) = self.match_pattern(pattern, &host) else {
                    continue;
                };
                let backends = route
                    .backends
                    .iter()
                    .map(|b| substitute_params(b, &captures))
                    .collect();
                return Some(RouteMatch {
                    route: route.clone(),
                    pattern: pattern.clone(),
                    captures,
                    backends,
                });
            }
        }
        None
    }

    fn match_pattern(&self, pattern: &str, host: &str) -> Option<Vec<String>> {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            return None;
        }
        if !pattern.contains(['*', '?', '\\']) {
            return (pattern == host).then(Vec::new);
        }

        let entry = self
            .compiled
            .entry(pattern.clone())
            .or_insert_with(|| match compile_wildcard_pattern(&pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(pattern = %pattern, error = %err, "router: invalid host pattern");
                    None
                }
            });
        let re = entry.value().as_ref()?;
        let caps = re.captures(host)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

/// Compiles a host glob: `*` matches any run, `?` one character, `\` escapes the next one.
/// Every wildcard becomes a capture group.
pub fn compile_wildcard_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let pattern = pattern.trim().to_ascii_lowercase();

    let mut out = String::with_capacity(pattern.len() + 16);
    out.push('^');

    let mut escape_next = false;
    for ch in pattern.chars() {
        if escape_next {
            out.push_str(&regex::escape(ch.encode_utf8(&mut [0; 4])));
            escape_next = false;
            continue;
        }
        match ch {
            '*' => out.push_str("(.*)"),
            '?' => out.push_str("(.)"),
            '\\' => escape_next = true,
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    if escape_next {
        out.push_str(r"\\");
    }

    out.push('$');
    Regex::new(&out)
}

/// Number of unescaped `*` and `?` in a host pattern.
pub fn count_wildcards(pattern: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for ch in pattern.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '*' | '?' => count += 1,
            _ => {}
        }
    }
    count
}

/// Distinct `$N` parameter indices referenced by a backend template, ascending.
pub fn parameter_indices(template: &str) -> Vec<usize> {
    let bytes = template.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end > start {
            if let Ok(n) = template[start..end].parse::<usize>() {
                out.push(n);
            }
        }
        i = end.max(i + 1);
    }
    out.sort_unstable();
    out.dedup();
    out
}

pub fn substitute_params(template: &str, groups: &[String]) -> String {
    if template.is_empty() || groups.is_empty() {
        return template.to_string();
    }

    // Replace from the end so $10 doesn't interfere with $1.
    let mut res = template.to_string();
    for i in (1..=groups.len()).rev() {
        res = res.replace(&format!("${i}"), &groups[i - 1]);
    }
    res
}
