//! CAS `serviceValidate` call and response parsing
//!
//! Protocol v2 payloads look like:
//!
//! ```xml
//! <cas:serviceResponse xmlns:cas="http://www.yale.edu/tp/cas">
//!   <cas:authenticationSuccess>
//!     <cas:user>jdoe</cas:user>
//!     <cas:attributes>
//!       <cas:email>jdoe@example.org</cas:email>
//!     </cas:attributes>
//!   </cas:authenticationSuccess>
//! </cas:serviceResponse>
//! ```
//!
//! or carry a `cas:authenticationFailure` element with a `code` attribute.

use axum::http::StatusCode;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::future::Future;

use super::error::{CasError, FormatError};
use super::extractors::UserIdentity;
use super::url::ServiceUrl;

/// Result of a validation call that reached CAS and could be interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Success(UserIdentity),
    Failure { code: String, message: String },
}

/// Raw answer of the identity provider, before interpretation
#[derive(Debug, Clone)]
pub struct ValidationReply {
    pub status: StatusCode,
    pub reason: String,
    pub body: String,
}

/// Redeems tickets against the identity provider
///
/// Implementors supply the transport in `fetch`; `validate` interprets the
/// reply and should not normally be overridden.
pub trait TicketValidator: Send + Sync + 'static {
    fn fetch(
        &self,
        ticket: &str,
        service: &ServiceUrl,
    ) -> impl Future<Output = Result<ValidationReply, CasError>> + Send;

    fn validate(
        &self,
        ticket: &str,
        service: &ServiceUrl,
    ) -> impl Future<Output = Result<ValidationOutcome, CasError>> + Send {
        async move {
            let reply = self.fetch(ticket, service).await?;
            if reply.status != StatusCode::OK {
                return Err(CasError::Transport {
                    status: reply.status,
                    message: transport_message(&reply),
                });
            }
            parse_service_response(&reply.body)
        }
    }
}

const BODY_EXCERPT_CHARS: usize = 200;

/// Reason phrase followed by the start of whatever the provider sent
fn transport_message(reply: &ValidationReply) -> String {
    let body = reply.body.trim();
    if body.is_empty() {
        return reply.reason.clone();
    }

    let mut excerpt: String = body.chars().take(BODY_EXCERPT_CHARS).collect();
    if excerpt.len() < body.len() {
        excerpt.push_str("...");
    }
    format!("{}: {}", reply.reason, excerpt)
}

/// Validator calling `{sso}/serviceValidate` over HTTP
pub struct HttpValidator {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpValidator {
    /// # Arguments
    /// * `sso` - CAS base URL, e.g. `https://sso.example.com/cas`
    /// * `client` - HTTP client, see `helpers::create_http_client`
    pub fn new(sso: &str, client: reqwest::Client) -> Self {
        Self {
            endpoint: format!("{}/serviceValidate", sso.trim_end_matches('/')),
            client,
        }
    }
}

impl TicketValidator for HttpValidator {
    async fn fetch(&self, ticket: &str, service: &ServiceUrl) -> Result<ValidationReply, CasError> {
        tracing::info!(
            endpoint = %self.endpoint,
            service = %service,
            ticket_len = ticket.len(),
            "Validating CAS ticket"
        );

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("ticket", ticket), ("service", service.as_str())])
            .send()
            .await
            .map_err(CasError::Unreachable)?;

        let status = response.status();
        let reason = status
            .canonical_reason()
            .unwrap_or("Unknown status")
            .to_string();
        let body = response.text().await.map_err(CasError::Unreachable)?;

        tracing::debug!(status = %status, body_len = body.len(), "CAS validation reply received");

        Ok(ValidationReply {
            status,
            reason,
            body,
        })
    }
}

// =============================================================================
// Response parsing
// =============================================================================

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn open(start: &BytesStart<'_>) -> Result<Self, quick_xml::Error> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(quick_xml::Error::from)?;
            attributes.push((key, value.into_owned()));
        }

        Ok(Element {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attributes,
            ..Element::default()
        })
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Depth-first search including self
    fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }
}

/// Builds the element tree, or `None` for a document without elements
///
/// A document has at most one root element; anything but whitespace,
/// comments and processing instructions outside it is rejected.
fn parse_tree(body: &str) -> Result<Option<Element>, FormatError> {
    let mut reader = Reader::from_str(body);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event()?;
        let outside = stack.is_empty();

        let closed = match event {
            Event::Start(start) => {
                if outside && root.is_some() {
                    return Err(FormatError::AfterRoot);
                }
                stack.push(Element::open(&start)?);
                None
            }
            Event::Empty(start) => {
                if outside && root.is_some() {
                    return Err(FormatError::AfterRoot);
                }
                Some(Element::open(&start)?)
            }
            Event::End(_) => stack.pop(),
            Event::Text(text) => {
                let text = text.unescape().map_err(quick_xml::Error::from)?;
                match stack.last_mut() {
                    Some(current) => current.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err(FormatError::TextOutsideRoot),
                }
                None
            }
            Event::CData(data) => {
                let current = stack.last_mut().ok_or(FormatError::TextOutsideRoot)?;
                current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                None
            }
            Event::Eof => break,
            _ => None,
        };

        if let Some(element) = closed {
            match stack.last_mut() {
                Some(parent) => parent.children.push(element),
                None => root = Some(element),
            }
        }
    }

    if let Some(open) = stack.pop() {
        return Err(FormatError::Unclosed(open.name));
    }

    Ok(root)
}

/// Interprets a `serviceValidate` response body
///
/// Malformed XML fails with `CasError::Format` before any interpretation.
/// CAS-reported failures become `ValidationOutcome::Failure`; a document that
/// is neither success nor failure fails with `CasError::UnexpectedResponse`.
pub fn parse_service_response(body: &str) -> Result<ValidationOutcome, CasError> {
    let unexpected = || CasError::UnexpectedResponse(body.trim().to_string());

    let root = parse_tree(body)
        .map_err(CasError::Format)?
        .filter(|root| root.name == "serviceResponse")
        .ok_or_else(unexpected)?;

    if let Some(failure) = root.find("authenticationFailure") {
        return Ok(ValidationOutcome::Failure {
            code: failure.attribute("code").unwrap_or_default().to_string(),
            message: failure.text.trim().to_string(),
        });
    }

    let success = root.find("authenticationSuccess").ok_or_else(unexpected)?;
    let user = success.find("user").ok_or_else(unexpected)?;

    let mut identity = UserIdentity::new(user.text.trim());
    if let Some(list) = success.find("attributes") {
        for child in &list.children {
            identity = identity.with_attribute(child.name.as_str(), child.text.trim());
        }
    }

    Ok(ValidationOutcome::Success(identity))
}

/// Replays one canned reply and records every call
#[cfg(test)]
pub(crate) struct StaticValidator {
    reply: ValidationReply,
    pub(crate) calls: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl StaticValidator {
    pub(crate) fn ok(body: &str) -> Self {
        Self::with_status(StatusCode::OK, body)
    }

    pub(crate) fn with_status(status: StatusCode, body: &str) -> Self {
        Self {
            reply: ValidationReply {
                status,
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                body: body.to_string(),
            },
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl TicketValidator for StaticValidator {
    async fn fetch(&self, ticket: &str, service: &ServiceUrl) -> Result<ValidationReply, CasError> {
        self.calls
            .lock()
            .unwrap()
            .push((ticket.to_string(), service.to_string()));
        Ok(self.reply.clone())
    }
}
