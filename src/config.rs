use std::env;
use std::time::Duration;

use crate::cas::{BehindProxy, CookieSettings, ServiceUrl, ServiceUrlResolver};

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Development,
    Production,
}

/// How the service URL sent to CAS is computed
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceUrlMode {
    /// Request URL as received
    Request,
    /// Behind a reverse proxy setting X-Forwarded-* headers
    Proxy {
        protocol: Option<String>,
        prefix: Option<String>,
        strip: Option<String>,
    },
    /// Fixed public URL
    Explicit(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    // Environment configuration
    pub environment: Environment,

    // Server configuration
    pub server_host: String,
    pub server_port: u16,

    // CAS server base URL (https://sso.example.com/cas)
    pub cas_sso_url: String,

    // Session cookie configuration (None = host-only cookie, Some = domain cookie)
    pub session_cookie_name: String,
    pub session_duration_secs: u64,
    pub cookie_domain: Option<String>,

    // HTTP client timeout configuration (in seconds)
    pub http_connect_timeout_secs: u64,
    pub http_request_timeout_secs: u64,

    pub service_url: ServiceUrlMode,
}

impl Config {
    /// Load configuration from environment variables using std::env::var
    pub fn load() -> anyhow::Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        // Empty values count as unset
        let var = |key: &str| var(key).filter(|s| !s.trim().is_empty());
        let number = |key: &str, default: u64| -> anyhow::Result<u64> {
            match var(key) {
                Some(s) => s
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("{} must be a number: {}", key, e)),
                None => Ok(default),
            }
        };

        let environment = match var("ENVIRONMENT")
            .unwrap_or_else(|| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        };

        // Required variables
        let cas_sso_url = var("CAS_SSO_URL")
            .ok_or_else(|| anyhow::anyhow!("CAS_SSO_URL environment variable is required"))?;

        // Optional variables with defaults
        let server_host = var("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let server_port = var("SERVER_PORT")
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(3000);

        let session_cookie_name = var("SESSION_COOKIE_NAME").unwrap_or_else(|| "session".to_string());
        let session_duration_secs = number("SESSION_DURATION_SECS", 86400)?;
        let cookie_domain = var("COOKIE_DOMAIN");

        let http_connect_timeout_secs = number("HTTP_CONNECT_TIMEOUT_SECS", 10)?;
        let http_request_timeout_secs = number("HTTP_REQUEST_TIMEOUT_SECS", 30)?;

        let service_url = match var("SERVICE_URL_MODE")
            .unwrap_or_else(|| "request".to_string())
            .to_lowercase()
            .as_str()
        {
            "request" => ServiceUrlMode::Request,
            "proxy" => {
                let prefix = var("PROXY_PATH_PREFIX");
                let strip = var("PROXY_PATH_STRIP");
                if prefix.is_some() && strip.is_some() {
                    anyhow::bail!("PROXY_PATH_PREFIX and PROXY_PATH_STRIP are mutually exclusive");
                }
                ServiceUrlMode::Proxy {
                    protocol: var("PROXY_PROTOCOL"),
                    prefix,
                    strip,
                }
            }
            "explicit" => ServiceUrlMode::Explicit(var("SERVICE_URL").ok_or_else(|| {
                anyhow::anyhow!("SERVICE_URL is required when SERVICE_URL_MODE=explicit")
            })?),
            other => anyhow::bail!(
                "SERVICE_URL_MODE must be one of request, proxy, explicit (got `{}`)",
                other
            ),
        };

        Ok(Config {
            environment,
            server_host,
            server_port,
            cas_sso_url,
            session_cookie_name,
            session_duration_secs,
            cookie_domain,
            http_connect_timeout_secs,
            http_request_timeout_secs,
            service_url,
        })
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Session cookie attributes; Secure only in production
    pub fn cookie_settings(&self) -> CookieSettings {
        CookieSettings::new(
            self.session_cookie_name.clone(),
            Duration::from_secs(self.session_duration_secs),
        )
        .domain(self.cookie_domain.clone())
        .secure(self.is_production())
    }

    pub fn service_url_resolver(&self) -> anyhow::Result<ServiceUrlResolver> {
        Ok(match &self.service_url {
            ServiceUrlMode::Request => ServiceUrlResolver::UseRequest,
            ServiceUrlMode::Proxy {
                protocol,
                prefix,
                strip,
            } => {
                let mut proxy = BehindProxy::new();
                if let Some(protocol) = protocol {
                    proxy = proxy.using(protocol.clone());
                }
                if let Some(prefix) = prefix {
                    proxy = proxy.prefixed(prefix.clone());
                }
                if let Some(strip) = strip {
                    proxy = proxy.stripping(strip.clone());
                }
                proxy.into()
            }
            ServiceUrlMode::Explicit(url) => ServiceUrl::parse(url)
                .map_err(|e| anyhow::anyhow!("SERVICE_URL is invalid: {}", e))?
                .into(),
        })
    }

    /// Get bind address for server
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
