use std::fs;
use std::net::SocketAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{StatusCode, header};

use mirrorgate_test::Process;

use crate::utils::{binary, write_config};

fn admin() -> String {
    format!("Basic {}", STANDARD.encode("op:secret"))
}

#[tokio::test]
async fn test_serve_and_exit() {
    mirrorgate_test::setup();
    let root = mirrorgate_test::tempdir();
    mirrorgate_test::write_file(&root.path().join("htdocs"), "maps/a.bsp", "map data");

    let socket: SocketAddr = ([127, 0, 0, 1], mirrorgate_test::free_port()).into();
    let config = write_config(root.path(), &socket.to_string());
    let server = Process::spawn(binary(), &config, socket).await;
    let client = mirrorgate_test::client();

    let response = client.get(server.url("/maps/a.bsp")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap(), "map data");

    let response = client.get(server.url("/mirror/b.bsp")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "http://mirror.example.com/mirror/b.bsp"
    );

    let response = client.get(server.url("/!exit")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(server.url("/!exit"))
        .header(header::AUTHORIZATION, admin())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().starts_with("Shutting down. ("));

    assert!(server.wait().await);

    let logs: Vec<_> = fs::read_dir(root.path().join("logs"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(logs.len(), 1);

    let log = fs::read_to_string(&logs[0]).unwrap();
    let lines: Vec<_> = log.lines().collect();
    assert_eq!(lines.len(), 4, "{log}");
    assert!(lines[0].contains("\"GET /maps/a.bsp HTTP/1.1\" 200 8"));
    assert!(lines[1].ends_with("\"[INFO] redirect to: http://mirror.example.com/mirror/b.bsp\""));
    assert!(lines[2].contains(" 401 "));
    assert!(lines[3].contains(" - op ["));
}
