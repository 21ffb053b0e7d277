//! Versioned route table
//!
//! Handler sets are mounted under path prefixes. The v1 set is mounted twice
//! (`/api` and `/api/v1`) with the same handler instances.

use async_trait::async_trait;
use hyper::{Method, Response};
use std::collections::HashMap;
use std::sync::Arc;

use super::version::{ApiVersion, VersionContext};
use super::BoxBody;
use crate::core::Core;

/// Everything a handler gets to see about a request
pub struct RequestContext<'a> {
    pub core: &'a Core,
    /// Named path parameters (`:id` segments)
    pub params: HashMap<String, String>,
    /// Decoded query string pairs
    pub query: HashMap<String, String>,
    /// Negotiated version of the request
    pub version: &'a VersionContext,
    /// Version of the handler set that matched
    pub mount_version: Option<ApiVersion>,
}

impl RequestContext<'_> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext<'_>) -> Response<BoxBody>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

/// Routes of one version, before they are mounted
#[derive(Clone, Default)]
pub struct RouteSet {
    routes: Vec<(Method, String, Arc<dyn Handler>)>,
}

impl RouteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: Method, pattern: &str, handler: Arc<dyn Handler>) -> Self {
        self.routes.push((method, pattern.to_string(), handler));
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

struct RouteEntry {
    method: Method,
    segments: Vec<Segment>,
    version: Option<ApiVersion>,
    handler: Arc<dyn Handler>,
}

/// A matched route
pub struct RouteMatch<'r> {
    pub handler: &'r Arc<dyn Handler>,
    pub params: HashMap<String, String>,
    pub version: Option<ApiVersion>,
}

#[derive(Default)]
pub struct Router {
    entries: Vec<RouteEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount every route of `set` under `prefix`
    pub fn mount(&mut self, prefix: &str, version: Option<ApiVersion>, set: &RouteSet) -> &mut Self {
        let prefix = parse_pattern(prefix);
        for (method, pattern, handler) in &set.routes {
            let mut segments = prefix.clone();
            segments.extend(parse_pattern(pattern));
            self.entries.push(RouteEntry {
                method: method.clone(),
                segments,
                version,
                handler: Arc::clone(handler),
            });
        }
        self
    }

    /// Register a single unversioned route
    pub fn route(&mut self, method: Method, pattern: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.entries.push(RouteEntry {
            method,
            segments: parse_pattern(pattern),
            version: None,
            handler,
        });
        self
    }

    /// Find the handler for `method` and `path`
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        self.entries
            .iter()
            .filter(|entry| entry.method == *method || (*method == Method::HEAD && entry.method == Method::GET))
            .find_map(|entry| {
                let params = match_segments(&entry.segments, &parts)?;
                Some(RouteMatch {
                    handler: &entry.handler,
                    params,
                    version: entry.version,
                })
            })
    }

    /// Whether any route matches `path` regardless of method
    pub fn matches_path(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.entries
            .iter()
            .any(|entry| match_segments(&entry.segments, &parts).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> Option<HashMap<String, String>> {
    if segments.len() != parts.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (segment, part) in segments.iter().zip(parts) {
        match segment {
            Segment::Literal(literal) if literal == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), (*part).to_string());
            }
        }
    }
    Some(params)
}

/// Parse a query string into decoded pairs (last value wins)
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::json_response;
    use hyper::StatusCode;

    struct Named(&'static str);

    #[async_trait]
    impl Handler for Named {
        async fn handle(&self, _ctx: &RequestContext<'_>) -> Response<BoxBody> {
            json_response(StatusCode::OK, &self.0)
        }
    }

    fn router() -> (Router, Arc<dyn Handler>) {
        let list: Arc<dyn Handler> = Arc::new(Named("list"));
        let v1 = RouteSet::new()
            .route(Method::GET, "/products", Arc::clone(&list))
            .route(Method::GET, "/products/:id", Arc::new(Named("detail")));
        let v2 = RouteSet::new().route(Method::GET, "/products", Arc::new(Named("list-v2")));

        let mut router = Router::new();
        router
            .mount("/api/v2", Some(ApiVersion::V2), &v2)
            .mount("/api/v1", Some(ApiVersion::V1), &v1)
            .mount("/api", Some(ApiVersion::V1), &v1);
        (router, list)
    }

    #[test]
    fn test_v1_set_is_mounted_twice_with_same_handler() {
        let (router, list) = router();

        let unversioned = router.find(&Method::GET, "/api/products").unwrap();
        let versioned = router.find(&Method::GET, "/api/v1/products").unwrap();

        assert!(Arc::ptr_eq(unversioned.handler, &list));
        assert!(Arc::ptr_eq(versioned.handler, &list));
        assert_eq!(unversioned.version, Some(ApiVersion::V1));
        assert_eq!(router.len(), 5);
    }

    #[test]
    fn test_v2_prefix_routes_to_v2_set() {
        let (router, list) = router();
        let found = router.find(&Method::GET, "/api/v2/products").unwrap();
        assert!(!Arc::ptr_eq(found.handler, &list));
        assert_eq!(found.version, Some(ApiVersion::V2));
        assert!(router.find(&Method::GET, "/api/v2/products/7").is_none());
    }

    #[test]
    fn test_path_params() {
        let (router, _) = router();
        let found = router.find(&Method::GET, "/api/v1/products/42/").unwrap();
        assert_eq!(found.params.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_method_mismatch() {
        let (router, _) = router();
        assert!(router.find(&Method::POST, "/api/products").is_none());
        assert!(router.find(&Method::HEAD, "/api/products").is_some());
        assert!(router.matches_path("/api/products"));
        assert!(!router.matches_path("/api/orders"));
    }

    #[test]
    fn test_parse_query() {
        let query = parse_query(Some("page=2&category=vitaminas%20C&page=3"));
        assert_eq!(query.get("page").map(String::as_str), Some("3"));
        assert_eq!(query.get("category").map(String::as_str), Some("vitaminas C"));
        assert!(parse_query(None).is_empty());
    }
}
