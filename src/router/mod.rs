//! Prefix routing: map wildcard path prefixes to handler factories.
//!
//! A route pattern is a path whose `*` segments match exactly one non-empty
//! path segment. A pattern matches every path that *starts with* its
//! segments, so the [`Router`] picks the longest matching pattern:
//!
//! | Pattern            | `/users/7/orders/3` | `/users/7` |
//! |--------------------|---------------------|------------|
//! | `/users`           | match               | match      |
//! | `/users/*`         | match               | match      |
//! | `/users/*/orders`  | match (selected)    | no match   |
//!
//! Two matching patterns of equal length resolve to the one registered first.

use crate::config::ConfigError;
use crate::handler::HandlerFactory;

/// Which request kinds a route accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePolicy {
    /// Plain HTTP only; WebSocket upgrade requests are rejected with `400`.
    HttpOnly,
    /// WebSocket upgrades only; plain requests are rejected with `400`.
    WebSocketOnly,
    Both,
}

// A single pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s {
                "*" => Segment::Wildcard,
                literal => Segment::Literal(literal.to_owned()),
            })
            .collect();

        Self {
            source: pattern.to_owned(),
            segments,
        }
    }

    fn len(&self) -> usize {
        self.source.len()
    }

    // `path` must not carry a query string.
    fn matches(&self, path: &str) -> bool {
        let mut path_segments = path.split('/').filter(|s| !s.is_empty());

        self.segments.iter().all(|segment| match path_segments.next() {
            Some(actual) => match segment {
                Segment::Literal(expected) => expected == actual,
                Segment::Wildcard => true,
            },
            None => false,
        })
    }
}

/// A registered route: one pattern bound to a handler factory and upgrade policy.
pub struct RoutePrefix {
    pattern: Pattern,
    factory: HandlerFactory,
    policy: UpgradePolicy,
}

impl RoutePrefix {
    /// Returns the pattern as it was registered, e.g. `/users/*/orders`.
    pub fn pattern(&self) -> &str {
        &self.pattern.source
    }

    /// Returns the route's upgrade policy.
    pub fn policy(&self) -> UpgradePolicy {
        self.policy
    }
}

/// The route selected for a request.
pub struct RouteMatch<'a> {
    pub factory: &'a HandlerFactory,
    /// The pattern that matched, used to build the request's restful params.
    pub prefix: &'a str,
    pub policy: UpgradePolicy,
}

/// Wildcard-prefix registry with longest-match resolution.
///
/// # Examples
///
/// ```rust
/// use gatehouse::envelope::ResponseEnvelope;
/// use gatehouse::handler;
/// use gatehouse::http::StatusCode;
/// use gatehouse::router::{Router, UpgradePolicy};
///
/// let ok = handler::from_fn(|_ctx| async { Ok(ResponseEnvelope::new(StatusCode::Ok)) });
///
/// let mut router = Router::new();
/// router.register(["/users"], ok.clone(), UpgradePolicy::HttpOnly).unwrap();
/// router.register(["/users/*/orders"], ok, UpgradePolicy::Both).unwrap();
///
/// let route = router.resolve("/users/42/orders/7").unwrap();
/// assert_eq!(route.prefix, "/users/*/orders");
/// assert_eq!(route.policy, UpgradePolicy::Both);
/// assert!(router.resolve("/accounts").is_none());
/// ```
#[derive(Default)]
pub struct Router {
    // Ascending by pattern length. Within one length the most recently
    // registered route comes first, so reverse iteration sees the oldest first.
    routes: Vec<RoutePrefix>,
}

impl Router {
    /// Creates an empty router. Every path resolves to `None` until
    /// something is registered.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Binds every pattern in `prefixes` to `factory` with `policy`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyPrefixes`] if `prefixes` yields nothing.
    pub fn register<I, S>(
        &mut self,
        prefixes: I,
        factory: HandlerFactory,
        policy: UpgradePolicy,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<Pattern> = prefixes
            .into_iter()
            .map(|p| Pattern::parse(p.as_ref()))
            .collect();
        if patterns.is_empty() {
            return Err(ConfigError::EmptyPrefixes);
        }

        for pattern in patterns {
            let position = self.routes.partition_point(|r| r.pattern.len() < pattern.len());
            self.routes.insert(
                position,
                RoutePrefix {
                    pattern,
                    factory: factory.clone(),
                    policy,
                },
            );
        }
        Ok(())
    }

    /// Finds the longest registered pattern matching `path` (no query string).
    pub fn resolve(&self, path: &str) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .rev()
            .find(|route| route.pattern.matches(path))
            .map(|route| RouteMatch {
                factory: &route.factory,
                prefix: &route.pattern.source,
                policy: route.policy,
            })
    }

    /// Iterates over the registered routes, shortest pattern first.
    ///
    /// # Returns
    ///
    /// One [`RoutePrefix`] per registered pattern, so a route registered
    /// under several prefixes shows up once for each.
    pub fn routes(&self) -> impl Iterator<Item = &RoutePrefix> {
        self.routes.iter()
    }

    /// Returns the number of registered patterns.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
