//! Helpers for testing the edge server and its service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function, e.g.
//!    `let root = test::tempdir()`.
//!
//!  - Hold a [`Server`] or [`Process`] until all requests to it have been made. Dropping them
//!    stops the server.

use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::process::{Child, Command};
use std::time::Duration;

use axum::Router;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the mirrorgate crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("mirrorgate=trace,mirrorgate_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// the directory is explicitly kept. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` to `path` below `root`, creating parent directories as needed.
pub fn write_file(root: &Path, path: &str, contents: impl AsRef<[u8]>) {
    let path = root.join(path.trim_start_matches('/'));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// An HTTP client that reports redirects instead of following them.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Returns a port on the loopback interface that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Returns a full URL pointing to `path` on the server at `addr`.
///
/// This URL uses `localhost` as hostname.
fn url_for(addr: SocketAddr, path: &str) -> Url {
    let path = path.trim_start_matches('/');
    format!("http://localhost:{}/{}", addr.port(), path)
        .parse()
        .unwrap()
}

/// An in-process HTTP server on an ephemeral port.
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves `router` with client addresses available as `ConnectInfo<SocketAddr>`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        url_for(self.socket, path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A server binary running as a child process.
pub struct Process {
    child: Child,
    socket: SocketAddr,
}

impl Process {
    /// Runs `binary -c <config> run` and waits until it accepts connections on `socket`.
    ///
    /// # Panics
    ///
    /// Panics if the process exits or does not listen within ten seconds.
    pub async fn spawn(binary: &Path, config: &Path, socket: SocketAddr) -> Self {
        let child = Command::new(binary)
            .arg("--config")
            .arg(config)
            .arg("run")
            .spawn()
            .unwrap();
        let mut process = Self { child, socket };

        for _ in 0..200 {
            if tokio::net::TcpStream::connect(socket).await.is_ok() {
                return process;
            }
            if let Some(status) = process.child.try_wait().unwrap() {
                panic!("server exited early with {status}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        panic!("server did not start listening on {socket}");
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        url_for(self.socket, path)
    }

    /// Waits for the process to exit on its own and returns whether it succeeded.
    pub async fn wait(mut self) -> bool {
        for _ in 0..200 {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status.success();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server did not exit");
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}
