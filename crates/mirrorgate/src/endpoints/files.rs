use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Response, StatusCode, Uri, header};
use axum::response::IntoResponse;

use mirrorgate_service::serving::{Outcome, Served};

use super::{Annotations, ResponseError, ServerState};

/// Serves or redirects a file request.
///
/// The path is taken from the URI as sent by the client, without percent-decoding, so that
/// redirects carry it unchanged.
pub async fn serve_file(State(state): State<ServerState>, uri: Uri) -> Response<Body> {
    let path = uri.path();
    // Control commands have their own routes, anything else in their namespace is unknown.
    if path.starts_with("/!") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Served {
        outcome,
        annotations,
    } = state.service.serve(path).await;

    let mut response = match into_response(outcome, path) {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    response.extensions_mut().insert(Annotations(annotations));
    response
}

fn into_response(outcome: Outcome, path: &str) -> Result<Response<Body>, ResponseError> {
    let response = match outcome {
        Outcome::NotFound => StatusCode::NOT_FOUND.into_response(),
        Outcome::NoDestination => {
            return Err(anyhow::anyhow!("no redirect destination for {path}").into());
        }
        Outcome::Redirect(url) => Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, HeaderValue::try_from(url)?)
            .body(Body::empty())?,
        Outcome::File { name, data } => Response::builder()
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, data.len())
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name.replace('"', "\\\"")),
            )
            .header("content-transfer-encoding", "binary")
            .header(header::EXPIRES, "0")
            .header(
                header::CACHE_CONTROL,
                "must-revalidate, post-check=0, pre-check=0",
            )
            .header(header::PRAGMA, "public")
            .body(Body::from(data))?,
    };

    Ok(response)
}
