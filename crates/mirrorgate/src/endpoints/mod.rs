use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use mirrorgate_service::service::EdgeService;

mod access_log;
mod auth;
mod control;
mod error;
mod files;
mod metrics;

pub use error::ResponseError;
use metrics::MetricsLayer;

/// Notes about a request that end up in its access log line.
///
/// Handlers attach them to the response extensions.
#[derive(Clone, Debug, Default)]
pub struct Annotations(pub Vec<String>);

/// The state shared by all handlers.
#[derive(Clone, Debug)]
pub struct ServerState {
    pub service: Arc<EdgeService>,
    /// Stops the HTTP server gracefully.
    pub shutdown: axum_server::Handle,
}

pub fn create_app(state: ServerState) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            access_log::log_request,
        ));

    let control = Router::new()
        .route("/!reload", get(control::reload))
        .route("/!clear", get(control::clear))
        .route("/!exit", get(control::exit))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ));

    Router::new()
        .route("/", get(files::serve_file))
        .route("/{*path}", get(files::serve_file))
        .merge(control)
        .with_state(state)
        .layer(layer)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use axum::http::StatusCode;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use mirrorgate_service::config::Config;
    use mirrorgate_test::Server;
    use reqwest::header;

    use super::*;

    /// A test server with a single catch-all rule that serves everything locally, except for
    /// files below `/mirror`.
    struct TestApp {
        root: mirrorgate_test::TempDir,
        service: Arc<EdgeService>,
        server: Server,
    }

    fn config_yaml(root: &Path, base_url: &str) -> String {
        format!(
            "root_dir: {root}
access_log:
  dir: {logs}
  filename: access.log
  flush_interval: 10ms
admin:
  user: op
  password: secret
cache:
  max_file_size: 16
redirects:
  - patterns: ['/mirror/**/*']
    targets:
      - weight: 1
        base_url: {base_url}
  - patterns: ['/**/*']
    targets:
      - weight: 1
        base_url: ''
      - weight: 1
        base_url: {base_url}
",
            root = root.join("htdocs").display(),
            logs = root.join("logs").display(),
        )
    }

    fn setup(base_url: &str) -> TestApp {
        mirrorgate_test::setup();
        let root = mirrorgate_test::tempdir();
        let config_path = root.path().join("config.yml");
        fs::write(&config_path, config_yaml(root.path(), base_url)).unwrap();
        mirrorgate_test::write_file(&root.path().join("htdocs"), "maps/a.bsp", "map data");

        let config = Config::get(Some(&config_path)).unwrap();
        let service = EdgeService::create(
            Some(config_path),
            config,
            &tokio::runtime::Handle::current(),
        )
        .unwrap();
        let service = Arc::new(service);

        let server = Server::with_router(create_app(ServerState {
            service: service.clone(),
            shutdown: axum_server::Handle::new(),
        }));

        TestApp {
            root,
            service,
            server,
        }
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    #[tokio::test]
    async fn test_serve_file() {
        let app = setup("http://mirror.example.com/");

        let response = mirrorgate_test::client()
            .get(app.server.url("/maps/a.bsp"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"a.bsp\""
        );
        assert_eq!(headers["content-transfer-encoding"], "binary");
        assert_eq!(headers[header::EXPIRES], "0");
        assert_eq!(
            headers[header::CACHE_CONTROL],
            "must-revalidate, post-check=0, pre-check=0"
        );
        assert_eq!(headers[header::PRAGMA], "public");
        assert_eq!(response.bytes().await.unwrap(), "map data");
    }

    #[tokio::test]
    async fn test_head_file() {
        let app = setup("http://mirror.example.com/");

        let response = mirrorgate_test::client()
            .head(app.server.url("/maps/a.bsp"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "8");
        assert!(response.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let app = setup("http://mirror.example.com/");

        let response = mirrorgate_test::client()
            .get(app.server.url("/maps/missing.bsp"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_redirect() {
        let app = setup("http://mirror.example.com/");

        let response = mirrorgate_test::client()
            .get(app.server.url("/mirror/maps/b.bsp"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://mirror.example.com/mirror/maps/b.bsp"
        );
    }

    #[tokio::test]
    async fn test_redirect_keeps_escapes() {
        let app = setup("http://mirror.example.com/");
        let client = mirrorgate_test::client();

        for path in [
            "/mirror/maps/a%3Fb.bsp",
            "/mirror/maps/a%20b.bsp",
            "/mirror/maps/c%23d.bsp",
        ] {
            let response = client.get(app.server.url(path)).send().await.unwrap();

            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(
                response.headers()[header::LOCATION],
                format!("http://mirror.example.com{path}").as_str()
            );
        }
    }

    #[tokio::test]
    async fn test_serve_file_with_escapes() {
        let app = setup("http://mirror.example.com/");
        mirrorgate_test::write_file(&app.root.path().join("htdocs"), "maps/a b.bsp", "spaced");

        let response = mirrorgate_test::client()
            .get(app.server.url("/maps/a%20b.bsp"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"a b.bsp\""
        );
        assert_eq!(response.bytes().await.unwrap(), "spaced");
    }

    #[tokio::test]
    async fn test_large_file_redirects() {
        let app = setup("http://mirror.example.com");
        mirrorgate_test::write_file(
            &app.root.path().join("htdocs"),
            "maps/large.bsp",
            [0u8; 32],
        );

        let response = mirrorgate_test::client()
            .get(app.server.url("/maps/large.bsp"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://mirror.example.com/maps/large.bsp"
        );
    }

    #[tokio::test]
    async fn test_unknown_control_path() {
        let app = setup("http://mirror.example.com/");

        let response = mirrorgate_test::client()
            .get(app.server.url("/!status"))
            .header(header::AUTHORIZATION, basic("op", "secret"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_control_requires_auth() {
        let app = setup("http://mirror.example.com/");
        let client = mirrorgate_test::client();

        for credentials in [None, Some(basic("op", "wrong")), Some(basic("admin", "secret"))] {
            let mut request = client.get(app.server.url("/!clear"));
            if let Some(credentials) = credentials {
                request = request.header(header::AUTHORIZATION, credentials);
            }
            let response = request.send().await.unwrap();

            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                response.headers()[header::WWW_AUTHENTICATE],
                "Basic realm=\"Admin only\""
            );
        }
    }

    #[tokio::test]
    async fn test_clear() {
        let app = setup("http://mirror.example.com/");
        let client = mirrorgate_test::client();

        client
            .get(app.server.url("/maps/a.bsp"))
            .send()
            .await
            .unwrap();
        assert!(!app.service.cache().is_empty());

        let response = client
            .get(app.server.url("/!clear"))
            .header(header::AUTHORIZATION, basic("op", "secret"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = response.text().await.unwrap();
        assert!(text.starts_with("Cache clear succeeded. ("), "{text}");
        assert!(app.service.cache().is_empty());
    }

    #[tokio::test]
    async fn test_reload() {
        let app = setup("http://mirror.example.com/");
        let client = mirrorgate_test::client();

        fs::write(
            app.root.path().join("config.yml"),
            config_yaml(app.root.path(), "http://other.example.com/"),
        )
        .unwrap();

        let response = client
            .get(app.server.url("/!reload"))
            .header(header::AUTHORIZATION, basic("op", "secret"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = response.text().await.unwrap();
        assert!(text.starts_with("Reload succeeded. ("), "{text}");

        let response = client
            .get(app.server.url("/mirror/x"))
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://other.example.com/mirror/x"
        );
    }

    #[tokio::test]
    async fn test_failed_reload() {
        let app = setup("http://mirror.example.com/");

        fs::write(app.root.path().join("config.yml"), "redirects: {").unwrap();

        let response = mirrorgate_test::client()
            .get(app.server.url("/!reload"))
            .header(header::AUTHORIZATION, basic("op", "secret"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = mirrorgate_test::client()
            .get(app.server.url("/mirror/x"))
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://mirror.example.com/mirror/x"
        );
    }

    #[tokio::test]
    async fn test_access_log() {
        let app = setup("http://mirror.example.com/");
        let client = mirrorgate_test::client();

        client
            .get(app.server.url("/maps/a.bsp"))
            .header(header::USER_AGENT, "test-agent")
            .send()
            .await
            .unwrap();
        client
            .get(app.server.url("/mirror/b.bsp"))
            .header(header::REFERER, "http://example.com/")
            .send()
            .await
            .unwrap();
        client
            .get(app.server.url("/!exit"))
            .header(header::AUTHORIZATION, basic("op", "secret"))
            .send()
            .await
            .unwrap();
        app.service.shutdown().await;

        let log = fs::read_to_string(app.root.path().join("logs/access.log")).unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 3, "{log}");

        assert!(lines[0].starts_with("127.0.0.1 - - ["), "{}", lines[0]);
        assert!(
            lines[0].ends_with("\"GET /maps/a.bsp HTTP/1.1\" 200 8 \"\" \"test-agent\""),
            "{}",
            lines[0]
        );
        assert!(
            lines[1].ends_with(
                "\"GET /mirror/b.bsp HTTP/1.1\" 302 0 \"http://example.com/\" \"\" \
                 \"[INFO] redirect to: http://mirror.example.com/mirror/b.bsp\""
            ),
            "{}",
            lines[1]
        );
        assert!(lines[2].starts_with("127.0.0.1 - op ["), "{}", lines[2]);
    }
}
