use std::net::SocketAddr;

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Response, header};
use axum::middleware::Next;
use chrono::Local;

use mirrorgate_service::access_log::LogLine;

use super::auth::BasicCredentials;
use super::{Annotations, ServerState};

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn content_length(response: &Response<Body>) -> u64 {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok()?.parse().ok())
        .or_else(|| response.body().size_hint().exact())
        .unwrap_or(0)
}

/// Writes one access log line for every request.
pub async fn log_request(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response<Body> {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let user = BasicCredentials::from_headers(request.headers()).map(|c| c.user);
    let method = request.method().to_string();
    let uri = request.uri().to_string();
    let version = format!("{:?}", request.version());
    let referer = header_str(request.headers(), header::REFERER);
    let user_agent = header_str(request.headers(), header::USER_AGENT);

    let response = next.run(request).await;

    let annotations = response
        .extensions()
        .get::<Annotations>()
        .map(|Annotations(notes)| notes.clone())
        .unwrap_or_default();

    let now = Local::now();
    let line = LogLine {
        remote_addr,
        user,
        time: now.into(),
        method,
        uri,
        version,
        status: response.status().as_u16(),
        content_length: content_length(&response),
        referer,
        user_agent,
        annotations,
    };
    state.service.log_access(&line, &now);

    response
}
