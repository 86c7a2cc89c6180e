use http::Method;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Composite cache/in-flight key: `METHOD:url:body`.
///
/// The body is serialized as compact JSON with object keys sorted at every
/// level, and is empty when absent, so two requests share a key exactly when
/// they would produce the same call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn new(method: &Method, url: &str, body: Option<&Value>) -> Self {
        let mut key = format!("{method}:{url}:");
        if let Some(body) = body {
            write_canonical(body, &mut key);
        }
        Self(key)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Compact JSON independent of the map's insertion order.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Freshness rules for a cacheable GET.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Entries younger than this are served without a network call
    pub max_age: Duration,

    /// Serve cached data and refresh it in the background
    pub stale_while_revalidate: bool,

    /// How long past `max_age` a stale entry may still be served while
    /// revalidating. Zero means only fresh entries are served.
    pub stale_window: Duration,

    /// Labels for bulk invalidation via `invalidate_tag`
    pub tags: Vec<String>,
}

impl CachePolicy {
    #[must_use]
    pub fn max_age(max_age: Duration) -> Self {
        Self {
            max_age,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stale_while_revalidate(mut self) -> Self {
        self.stale_while_revalidate = true;
        self
    }

    #[must_use]
    pub fn stale_window(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = true;
        self.stale_window = window;
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A JSON call against the storefront backend.
///
/// ```
/// use std::time::Duration;
/// use storefront_http::{ApiRequest, CachePolicy};
///
/// let request = ApiRequest::get("/products?collection=soy")
///     .header("x-storefront-locale", "en-GB")
///     .cache(CachePolicy::max_age(Duration::from_secs(60)).stale_while_revalidate());
/// assert!(request.cache_key().as_str().starts_with("GET:/products"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub cache: Option<CachePolicy>,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
            cache: None,
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    #[must_use]
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, url).json(body)
    }

    #[must_use]
    pub fn put(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, url).json(body)
    }

    #[must_use]
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// GraphQL POST with a `{ "query", "variables" }` body.
    #[must_use]
    pub fn graphql(url: impl Into<String>, query: &str, variables: Value) -> Self {
        Self::post(
            url,
            serde_json::json!({
                "query": query,
                "variables": variables,
            }),
        )
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Header names and values are validated when the request is sent.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url, self.body.as_ref())
    }

    /// Cache policy that applies to this request: only GETs are cached.
    #[must_use]
    pub fn cache_policy(&self) -> Option<&CachePolicy> {
        if self.method == Method::GET {
            self.cache.as_ref()
        } else {
            None
        }
    }
}
