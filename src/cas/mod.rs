//! CAS service-provider login
//!
//! This module implements the client side of the CAS protocol as an axum
//! middleware.
//!
//! ## Structure
//!
//! - `url`: service URL value type and resolution strategies (request, proxy, explicit)
//! - `validate`: `serviceValidate` call and XML response parsing
//! - `session`: session store contract, RAII guard and in-memory store
//! - `login`: the login state machine and middleware
//! - `redirect`: fragment-preserving login redirect page
//! - `extractors`: user identity and the axum extractor for handlers
//! - `helpers`: cookie extraction, HTTP client, log digests
//!
//! ## Authentication Flow
//!
//! 1. Anonymous request → HTML page redirecting to `{sso}/login?service=...`
//! 2. CAS authenticates → redirect back with `?ticket=ST-...`
//! 3. Ticket validated via `{sso}/serviceValidate` → session cookie set → 302 to self without ticket
//! 4. Subsequent requests carry the session cookie → handler runs with the user attached

pub mod error;
pub mod extractors;
pub mod helpers;
pub mod login;
pub mod redirect;
pub mod session;
pub mod url;
pub mod validate;

pub use error::{CasError, FormatError};
pub use extractors::{AuthenticatedUser, UserIdentity};
pub use login::{require_login, CasLogin, USER_KEY};
pub use session::{CookieSettings, MemorySession, MemorySessions, Session, SessionGuard, Sessions};
pub use url::{BehindProxy, PathRewrite, ServiceUrl, ServiceUrlResolver};
pub use validate::{HttpValidator, TicketValidator, ValidationOutcome, ValidationReply};
