use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::Request;
use axum::http::{Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service as TowerService;

use mirrorgate_service::metric;

/// Which part of the server handled a request, used to tag metrics.
fn request_kind(request: &Request) -> &'static str {
    if request.uri().path().starts_with("/!") {
        "control"
    } else {
        "file"
    }
}

/// Records the duration and status code of every request.
#[derive(Clone, Debug)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        MetricsService { service }
    }
}

#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    service: S,
}

impl<S, B> TowerService<Request> for MetricsService<S>
where
    S: TowerService<Request, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    B: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let kind = request_kind(&request);
        let start = Instant::now();
        let future = self.service.call(request);

        Box::pin(async move {
            let result = future.await;

            metric!(timer("requests.duration") = start.elapsed(), "kind" => kind);
            let status = result
                .as_ref()
                .map(|response| response.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            metric!(
                counter("responses.status_code") += 1,
                "status" => status.as_str(),
                "kind" => kind,
            );

            result
        })
    }
}
