//! HTTP replication fetcher against a local stub server.

use chrono::NaiveDate;
use osm_for_cities::error::PipelineError;
use osm_for_cities::fetch::{DiffSource, FetchOutcome, HttpReplication};
use osm_for_cities::sequence::SequenceNumber;
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const DIFF_BODY: &[u8] = b"\x1f\x8bfake-osc-gz-payload";

/// Serves `000/000/001.osc.gz` with 200, `000/000/002.osc.gz` with 404 and
/// everything else with 500.
async fn start_stub() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf);
                let path = request.split_whitespace().nth(1).unwrap_or("").to_string();

                let (status, body): (&str, &[u8]) =
                    if path.ends_with("/replication/day/000/000/001.osc.gz") {
                        ("200 OK", DIFF_BODY)
                    } else if path.ends_with("/replication/day/000/000/002.osc.gz") {
                        ("404 Not Found", b"not found")
                    } else {
                        ("500 Internal Server Error", b"boom")
                    };
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2012, 9, 12).unwrap()
}

#[tokio::test]
async fn test_published_diff_is_downloaded() {
    let addr = start_stub().await;
    let tmp = TempDir::new().unwrap();
    let source = HttpReplication::new(&format!("http://{}", addr), 10).unwrap();

    let outcome = source
        .fetch(day(), SequenceNumber::new(1), &tmp.path().join("history"))
        .await
        .unwrap();

    let FetchOutcome::Fetched(changeset) = outcome else {
        panic!("expected a downloaded diff");
    };
    assert_eq!(changeset.day, day());
    assert_eq!(changeset.sequence, SequenceNumber::new(1));
    assert!(changeset.local_path.ends_with("000000001.osc.gz"));
    assert_eq!(std::fs::read(&changeset.local_path).unwrap(), DIFF_BODY);

    let names: Vec<String> = std::fs::read_dir(tmp.path().join("history"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["000000001.osc.gz".to_string()]);
}

#[tokio::test]
async fn test_missing_diff_is_not_available() {
    let addr = start_stub().await;
    let tmp = TempDir::new().unwrap();
    let source = HttpReplication::new(&format!("http://{}/", addr), 10).unwrap();

    let outcome = source
        .fetch(day(), SequenceNumber::new(2), tmp.path())
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::NotAvailable));
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_server_error_is_fatal() {
    let addr = start_stub().await;
    let tmp = TempDir::new().unwrap();
    let source = HttpReplication::new(&format!("http://{}", addr), 10).unwrap();

    let err = source
        .fetch(day(), SequenceNumber::new(3), tmp.path())
        .await
        .unwrap_err();
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::Download { status, url }) => {
            assert_eq!(*status, 500);
            assert!(url.ends_with("000/000/003.osc.gz"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
