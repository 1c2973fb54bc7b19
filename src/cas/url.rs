//! Service URL computation
//!
//! The service URL is sent to CAS on login, echoed back with the ticket and
//! sent again on validation. CAS compares the two verbatim, so everything in
//! here preserves the raw query bytes of parameters it does not touch.

use axum::http::{HeaderMap, Request};
use std::fmt;
use url::Url;

use super::error::CasError;

const FORWARDED_HOST: &str = "x-forwarded-host";
const FORWARDED_PROTO: &str = "x-forwarded-proto";
const FORWARDED_PORT: &str = "x-forwarded-port";

/// Absolute, immutable service URL. Derivations return copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrl(Url);

impl ServiceUrl {
    pub fn parse(input: &str) -> Result<Self, CasError> {
        Url::parse(input)
            .map(ServiceUrl)
            .map_err(|source| CasError::InvalidServiceUrl {
                input: input.to_string(),
                source,
            })
    }

    /// The request's own URL: `http` unless the request URI is absolute,
    /// authority from the URI, then the `Host` header, then `localhost`.
    pub fn from_request<B>(request: &Request<B>) -> Result<Self, CasError> {
        let uri = request.uri();
        let scheme = uri.scheme_str().unwrap_or("http");
        let host = match uri.authority() {
            Some(authority) => authority.as_str(),
            None => header(request.headers(), "host").unwrap_or("localhost"),
        };
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        Self::parse(&format!("{}://{}{}", scheme, host, path_and_query))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// First value of a query parameter, decoded
    pub fn param(&self, name: &str) -> Option<String> {
        query_param(self.0.query(), name)
    }

    /// Copy with every occurrence of `name` removed; the remaining pairs keep
    /// their order and raw encoding. An emptied query is dropped entirely.
    pub fn without_param(&self, name: &str) -> Self {
        let Some(query) = self.0.query() else {
            return self.clone();
        };

        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty() && !has_key(pair, name))
            .collect();

        let mut url = self.0.clone();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&kept.join("&")));
        }
        ServiceUrl(url)
    }

    /// Copy with `name` set to `value`, replacing previous occurrences
    pub fn with_param(&self, name: &str, value: &str) -> Self {
        let mut url = self.without_param(name).0;
        let pair: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(name, value)
            .finish();
        let query = match url.query() {
            Some(existing) => format!("{}&{}", existing, pair),
            None => pair,
        };
        url.set_query(Some(&query));
        ServiceUrl(url)
    }

    /// Copy with the fragment replaced; empty fragments are removed
    pub fn with_fragment(&self, fragment: Option<&str>) -> Self {
        let mut url = self.0.clone();
        url.set_fragment(fragment.filter(|f| !f.is_empty()));
        ServiceUrl(url)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// First decoded value of `name` in a raw query string
pub(crate) fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn has_key(pair: &str, name: &str) -> bool {
    let raw_key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
    url::form_urlencoded::parse(raw_key.as_bytes())
        .next()
        .is_some_and(|(key, _)| key == name)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Rewrites the request path when the proxy mounts the application
/// somewhere else than where it listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRewrite {
    Prefix(String),
    Strip(String),
}

impl PathRewrite {
    /// Rewritten path, always absolute. Stripping only removes whole
    /// segments: `/app` strips `/app/x` but leaves `/application/x` alone.
    pub fn apply(&self, path: &str) -> String {
        let rewritten = match self {
            PathRewrite::Prefix(base) => format!("{}{}", base.trim_end_matches('/'), path),
            PathRewrite::Strip(base) => {
                let base = base.trim_matches('/');
                match path.strip_prefix('/').and_then(|p| p.strip_prefix(base)) {
                    Some(rest) if !base.is_empty() && (rest.is_empty() || rest.starts_with('/')) => {
                        rest.to_string()
                    }
                    _ => path.to_string(),
                }
            }
        };

        if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{}", rewritten)
        }
    }
}

/// Service URL as seen by clients of a reverse proxy
///
/// Uses `X-Forwarded-Host`, `X-Forwarded-Proto` (default `https`) and
/// `X-Forwarded-Port`. Without a forwarded host, the request URL is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BehindProxy {
    protocol: Option<String>,
    path: Option<PathRewrite>,
}

impl BehindProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a protocol, one of "http" or "https", ignoring `X-Forwarded-Proto`
    pub fn using(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn prefixed(mut self, base: impl Into<String>) -> Self {
        self.path = Some(PathRewrite::Prefix(base.into()));
        self
    }

    pub fn stripping(mut self, base: impl Into<String>) -> Self {
        self.path = Some(PathRewrite::Strip(base.into()));
        self
    }

    pub fn resolve<B>(&self, request: &Request<B>) -> Result<ServiceUrl, CasError> {
        let headers = request.headers();

        // Chained proxies append to the list; the first entry faces the client
        let Some(forwarded) = header(headers, FORWARDED_HOST)
            .and_then(|list| list.split(',').next())
            .map(str::trim)
            .filter(|host| !host.is_empty())
        else {
            return ServiceUrl::from_request(request);
        };

        let scheme = match &self.protocol {
            Some(protocol) => protocol.as_str(),
            None => header(headers, FORWARDED_PROTO)
                .and_then(|list| list.split(',').next())
                .map(str::trim)
                .unwrap_or("https"),
        };

        let uri = request.uri();
        let path = match &self.path {
            Some(rewrite) => rewrite.apply(uri.path()),
            None => uri.path().to_string(),
        };

        let mut url = origin(scheme, forwarded)?;
        url.0.set_path(&path);
        url.0.set_query(uri.query());

        if let Some(port) = header(headers, FORWARDED_PORT) {
            match port.parse::<u16>() {
                Ok(port) => {
                    // Only fails for URLs without a host, which `origin` excludes
                    let _ = url.0.set_port(Some(port));
                }
                Err(_) => tracing::warn!(
                    forwarded_port = %port,
                    "Ignoring unparsable X-Forwarded-Port header"
                ),
            }
        }

        tracing::debug!(
            forwarded_host = %forwarded,
            service_url = %url,
            "Resolved service URL behind proxy"
        );

        Ok(url)
    }
}

/// `scheme://host/` from a forwarded host, which must not smuggle in a
/// path, query, fragment or credentials
fn origin(scheme: &str, host: &str) -> Result<ServiceUrl, CasError> {
    let input = format!("{}://{}/", scheme, host);
    let parsed = ServiceUrl::parse(&input)?;

    let clean = parsed.0.path() == "/"
        && parsed.0.query().is_none()
        && parsed.0.fragment().is_none()
        && parsed.0.username().is_empty()
        && parsed.0.password().is_none();
    if !clean {
        return Err(CasError::InvalidServiceUrl {
            input,
            source: url::ParseError::InvalidDomainCharacter,
        });
    }
    Ok(parsed)
}

/// Strategy computing the externally visible URL of a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ServiceUrlResolver {
    #[default]
    UseRequest,
    BehindProxy(BehindProxy),
    /// Fixed public address, independent of request routing
    Explicit(ServiceUrl),
}

impl ServiceUrlResolver {
    pub fn resolve<B>(&self, request: &Request<B>) -> Result<ServiceUrl, CasError> {
        match self {
            ServiceUrlResolver::UseRequest => ServiceUrl::from_request(request),
            ServiceUrlResolver::BehindProxy(proxy) => proxy.resolve(request),
            ServiceUrlResolver::Explicit(url) => Ok(url.clone()),
        }
    }
}

impl From<BehindProxy> for ServiceUrlResolver {
    fn from(proxy: BehindProxy) -> Self {
        ServiceUrlResolver::BehindProxy(proxy)
    }
}

impl From<ServiceUrl> for ServiceUrlResolver {
    fn from(url: ServiceUrl) -> Self {
        ServiceUrlResolver::Explicit(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_from_request_defaults_to_localhost() {
        let url = ServiceUrl::from_request(&request("/", &[])).unwrap();
        assert_eq!(url.as_str(), "http://localhost/");
    }

    #[test]
    fn test_from_request_uses_host_header() {
        let url = ServiceUrl::from_request(&request("/a?b=c", &[("host", "app.local:8080")])).unwrap();
        assert_eq!(url.as_str(), "http://app.local:8080/a?b=c");
    }

    #[test]
    fn test_from_request_rejects_garbage_host() {
        let result = ServiceUrl::from_request(&request("/", &[("host", "bad host")]));
        assert!(matches!(result, Err(CasError::InvalidServiceUrl { .. })));
    }

    #[test]
    fn test_without_param_drops_emptied_query() {
        let url = ServiceUrl::parse("http://localhost/?ticket=ST-1").unwrap();
        assert_eq!(url.without_param("ticket").as_str(), "http://localhost/");
    }

    #[test]
    fn test_without_param_preserves_raw_encoding_and_order() {
        let url = ServiceUrl::parse("http://localhost/x?b=1%202&ticket=ST-1&a=%7E").unwrap();
        assert_eq!(
            url.without_param("ticket").as_str(),
            "http://localhost/x?b=1%202&a=%7E"
        );
    }

    #[test]
    fn test_without_missing_param_is_identity() {
        let url = ServiceUrl::parse("http://localhost/x?a=b+c").unwrap();
        assert_eq!(url.without_param("ticket"), url);
    }

    #[test]
    fn test_with_param_replaces_existing() {
        let url = ServiceUrl::parse("http://localhost/?a=1&b=2").unwrap();
        assert_eq!(url.with_param("a", "x y").as_str(), "http://localhost/?b=2&a=x+y");
        assert_eq!(url.with_param("a", "x y").param("a").as_deref(), Some("x y"));
    }

    #[test]
    fn test_query_param_decodes_first_value() {
        assert_eq!(query_param(Some("_=a%2Fb&_=c"), "_").as_deref(), Some("a/b"));
        assert_eq!(query_param(Some("ticket="), "ticket").as_deref(), Some(""));
        assert_eq!(query_param(None, "ticket"), None);
    }

    #[test]
    fn test_with_fragment() {
        let url = ServiceUrl::parse("http://localhost/app").unwrap();
        assert_eq!(url.with_fragment(Some("top")).as_str(), "http://localhost/app#top");
        assert_eq!(url.with_fragment(Some("")).as_str(), "http://localhost/app");
        assert_eq!(url.with_fragment(None).as_str(), "http://localhost/app");
    }

    #[test]
    fn test_prefixed_path() {
        let proxy = BehindProxy::new().prefixed("/app/");
        let url = proxy
            .resolve(&request("/x", &[("x-forwarded-host", "pub.example.com")]))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/app/x");
    }

    #[test]
    fn test_stripped_path() {
        let proxy = BehindProxy::new().stripping("/app");
        let url = proxy
            .resolve(&request("/app/x", &[("x-forwarded-host", "pub.example.com")]))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/x");
    }

    #[test]
    fn test_stripping_to_empty_yields_root() {
        let proxy = BehindProxy::new().stripping("/app");
        let url = proxy
            .resolve(&request("/app", &[("x-forwarded-host", "pub.example.com")]))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/");
    }

    #[test]
    fn test_prefix_without_leading_slash() {
        let proxy = BehindProxy::new().prefixed("app");
        let url = proxy
            .resolve(&request("/x", &[("x-forwarded-host", "pub.example.com")]))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/app/x");
    }

    #[test]
    fn test_stripping_only_whole_segments() {
        let proxy = BehindProxy::new().stripping("/app");
        let url = proxy
            .resolve(&request("/application/x", &[("x-forwarded-host", "pub.example.com")]))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/application/x");
    }

    #[test]
    fn test_stripping_base_without_leading_slash() {
        let proxy = BehindProxy::new().stripping("app/");
        let url = proxy
            .resolve(&request("/app/x", &[("x-forwarded-host", "pub.example.com")]))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/x");
    }

    #[test]
    fn test_path_rewrite_is_always_absolute() {
        assert_eq!(PathRewrite::Prefix("app".to_string()).apply("/x"), "/app/x");
        assert_eq!(PathRewrite::Prefix(String::new()).apply("/x"), "/x");
        assert_eq!(PathRewrite::Strip("/app".to_string()).apply("/app/x"), "/x");
        assert_eq!(PathRewrite::Strip("/app".to_string()).apply("/appx"), "/appx");
        assert_eq!(PathRewrite::Strip("/app/".to_string()).apply("/app"), "/");
        assert_eq!(PathRewrite::Strip("/".to_string()).apply("/x"), "/x");
    }

    #[test]
    fn test_forwarded_host_cannot_carry_a_path() {
        let result = BehindProxy::new().resolve(&request(
            "/x",
            &[("x-forwarded-host", "pub.example.com/evil")],
        ));
        assert!(matches!(result, Err(CasError::InvalidServiceUrl { .. })));
    }

    #[test]
    fn test_forwarded_host_cannot_carry_credentials() {
        let result = BehindProxy::new().resolve(&request(
            "/x",
            &[("x-forwarded-host", "user@pub.example.com")],
        ));
        assert!(matches!(result, Err(CasError::InvalidServiceUrl { .. })));
    }

    #[test]
    fn test_forwarded_proto_and_port() {
        let proxy = BehindProxy::new();
        let url = proxy
            .resolve(&request(
                "/x?y=1",
                &[
                    ("x-forwarded-host", "pub.example.com"),
                    ("x-forwarded-proto", "http"),
                    ("x-forwarded-port", "8080"),
                ],
            ))
            .unwrap();
        assert_eq!(url.as_str(), "http://pub.example.com:8080/x?y=1");
    }

    #[test]
    fn test_using_overrides_forwarded_proto() {
        let proxy = BehindProxy::new().using("https");
        let url = proxy
            .resolve(&request(
                "/",
                &[("x-forwarded-host", "pub.example.com"), ("x-forwarded-proto", "http")],
            ))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/");
    }

    #[test]
    fn test_first_forwarded_host_wins() {
        let url = BehindProxy::new()
            .resolve(&request("/", &[("x-forwarded-host", "pub.example.com, inner.local")]))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/");
    }

    #[test]
    fn test_invalid_forwarded_port_is_ignored() {
        let url = BehindProxy::new()
            .resolve(&request(
                "/",
                &[("x-forwarded-host", "pub.example.com"), ("x-forwarded-port", "http")],
            ))
            .unwrap();
        assert_eq!(url.as_str(), "https://pub.example.com/");
    }

    #[test]
    fn test_behind_proxy_without_forwarded_host_uses_request() {
        let proxy = BehindProxy::new().prefixed("/app");
        let url = proxy.resolve(&request("/x", &[("host", "internal:9000")])).unwrap();
        assert_eq!(url.as_str(), "http://internal:9000/x");
    }

    #[test]
    fn test_explicit_ignores_request() {
        let resolver: ServiceUrlResolver = ServiceUrl::parse("https://example.com/").unwrap().into();
        let url = resolver
            .resolve(&request("/other?ticket=x", &[("x-forwarded-host", "evil.example")]))
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/");
    }

    #[test]
    fn test_resolution_is_stable() {
        let resolver: ServiceUrlResolver = BehindProxy::new().stripping("/app").into();
        let req = request("/app/x?a=%20&ticket=T", &[("x-forwarded-host", "pub.example.com")]);
        let first = resolver.resolve(&req).unwrap().without_param("ticket");
        let second = resolver.resolve(&req).unwrap().without_param("ticket");
        assert_eq!(first.as_str(), second.as_str());
        assert_eq!(first.as_str(), "https://pub.example.com/x?a=%20");
    }
}
