use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::routing::get;
use cvrelay_client::download_to_dir;

const PAYLOAD: &[u8] = b"not really an mp4, but the bytes are what count";

async fn serve_fixture() -> SocketAddr {
    let app = Router::new().route("/videos/clip.mp4", get(|| async { PAYLOAD.to_vec() }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cvrelay-dl-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[tokio::test]
async fn downloads_with_deterministic_naming() {
    let addr = serve_fixture().await;
    let url = format!("http://{addr}/videos/clip.mp4?sig=abc");
    let dir = scratch_dir("naming");
    let http = wreq::Client::new();

    let path = download_to_dir(&http, &url, &dir, "task/771", false)
        .await
        .unwrap();

    assert_eq!(path, dir.join("task-771-clip.mp4"));
    assert_eq!(std::fs::read(&path).unwrap(), PAYLOAD);
}

#[tokio::test]
async fn refuses_then_allows_overwrite() {
    let addr = serve_fixture().await;
    let url = format!("http://{addr}/videos/clip.mp4");
    let dir = scratch_dir("overwrite");
    let http = wreq::Client::new();

    std::fs::create_dir_all(&dir).unwrap();
    let existing = dir.join("task-9-clip.mp4");
    std::fs::write(&existing, b"stale bytes").unwrap();

    let err = download_to_dir(&http, &url, &dir, "task-9", false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));
    assert_eq!(std::fs::read(&existing).unwrap(), b"stale bytes");

    let path = download_to_dir(&http, &url, &dir, "task-9", true)
        .await
        .unwrap();
    assert_eq!(path, existing);
    assert_eq!(
        std::fs::read(&path).unwrap(),
        PAYLOAD,
        "file bytes must equal the server response body"
    );
}

#[tokio::test]
async fn rejects_non_http_schemes() {
    let dir = scratch_dir("scheme");
    let http = wreq::Client::new();
    for url in ["ftp://cdn.example/clip.mp4", "file:///etc/passwd", "data:x"] {
        let err = download_to_dir(&http, url, &dir, "task", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("non-http(s)"), "url {url}");
    }
}

#[tokio::test]
async fn http_errors_do_not_create_files() {
    let addr = serve_fixture().await;
    let url = format!("http://{addr}/videos/missing.mp4");
    let dir = scratch_dir("missing");
    let http = wreq::Client::new();

    let err = download_to_dir(&http, &url, &dir, "task-x", false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("HTTP 404"));
    assert!(!dir.join("task-x-missing.mp4").exists());
}
