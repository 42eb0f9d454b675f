use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Response, StatusCode, header};
use axum::middleware::Next;
use axum::response::IntoResponse;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use mirrorgate_service::config::AdminConfig;
use mirrorgate_service::metric;

use super::ServerState;

/// The realm announced to clients that fail to authenticate.
const REALM: &str = "Admin only";

/// Credentials of a Basic `Authorization` header.
#[derive(Debug, PartialEq, Eq)]
pub struct BasicCredentials {
    pub user: String,
    pub password: String,
}

impl BasicCredentials {
    /// Parses the `Authorization` header, if it holds Basic credentials.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;

        Some(Self {
            user: user.to_owned(),
            password: password.to_owned(),
        })
    }

    fn matches(&self, admin: &AdminConfig) -> bool {
        self.user == admin.user && self.password == admin.password
    }
}

/// Rejects requests that do not carry the admin credentials of the current configuration.
pub async fn require_admin(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response<Body> {
    let config = state.service.config();
    let authorized = BasicCredentials::from_headers(request.headers())
        .is_some_and(|credentials| credentials.matches(&config.admin));

    if !authorized {
        tracing::warn!(uri = %request.uri(), "Rejected unauthorized control request");
        metric!(counter("control.unauthorized") += 1);
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, format!("Basic realm=\"{REALM}\""))],
        )
            .into_response();
    }

    next.run(request).await
}
