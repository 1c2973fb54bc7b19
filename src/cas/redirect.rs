//! Login redirect page
//!
//! Browsers never send the URL fragment, and a `Location` redirect to CAS
//! would lose it. The page below forwards the fragment as a `_` query
//! parameter of the service URL (encoded twice: once as the parameter value,
//! once as part of the `service` value) and falls back to a meta refresh,
//! without the fragment, when scripts are disabled.

use askama::Template;
use axum::response::{Html, IntoResponse, Response};

use super::error::CasError;
use super::url::ServiceUrl;

/// Query parameter carrying the fragment through the CAS round trip
pub const FRAGMENT_PARAM: &str = "_";

#[derive(Template)]
#[template(path = "redirect.html", escape = "none")]
pub struct LoginRedirect {
    pub target: String,
}

impl LoginRedirect {
    /// Redirect to `{sso}/login?service=<service>`
    pub fn new(sso: &str, service: &ServiceUrl) -> Self {
        Self {
            target: login_url(sso, service),
        }
    }

    pub fn into_html(self) -> Result<Response, CasError> {
        let html = self.render()?;
        Ok(Html(html).into_response())
    }
}

pub fn login_url(sso: &str, service: &ServiceUrl) -> String {
    format!(
        "{}/login?service={}",
        sso.trim_end_matches('/'),
        urlencoding::encode(service.as_str())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_url_encodes_service() {
        let service = ServiceUrl::parse("http://localhost/a?b=c").unwrap();
        assert_eq!(
            login_url("https://sso.example.com/", &service),
            "https://sso.example.com/login?service=http%3A%2F%2Flocalhost%2Fa%3Fb%3Dc"
        );
    }

    #[test]
    fn test_page_contains_meta_refresh_and_script() {
        let service = ServiceUrl::parse("http://localhost/").unwrap();
        let html = LoginRedirect::new("https://sso.example.com", &service)
            .render()
            .unwrap();
        let target = "https://sso.example.com/login?service=http%3A%2F%2Flocalhost%2F";

        assert!(html.contains(&format!(
            r#"<meta http-equiv="refresh" content="1; URL={}">"#,
            target
        )));
        assert!(html.contains(&format!(r#"document.location.replace("{}" + encodeURIComponent("#, target)));
        assert!(html.contains(r#"(document.location.search ? "&_=" : "?_=")"#));
        assert!(html.contains("encodeURIComponent(hash)"));
    }
}
