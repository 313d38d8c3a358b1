//! HTTP point lookups against a [`View`].
//!
//! `GET /{key}` answers `200` with the JSON encoding of the key's current
//! value, or `null` when the key is unknown. Internal errors (a partition
//! still catching up, a corrupt value) are logged and also answered with
//! `null`, so callers never see them.

use std::io;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::live::stopped;
use crate::view::View;

/// Build the lookup router for `view`.
pub fn router<V>(view: View<V>) -> Router
where
    V: Serialize + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(missing_key))
        .route("/:key", get(lookup::<V>))
        .with_state(view)
}

async fn lookup<V>(State(view): State<View<V>>, Path(key): Path<String>) -> Json<Option<V>>
where
    V: Serialize + Send + Sync + 'static,
{
    match view.get(&key) {
        Ok(value) => Json(value),
        Err(e) => {
            tracing::debug!(key = %key, error = %e, "lookup failed, answering null");
            Json(None)
        }
    }
}

async fn missing_key() -> Json<Option<()>> {
    Json(None)
}

/// Serve lookups on `listener` until `shutdown` carries `true`.
///
/// # Errors
///
/// Returns `io::Error` if the server fails.
pub async fn serve<V>(
    listener: TcpListener,
    view: View<V>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    V: Serialize + Send + Sync + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, topic = %view.topic(), "query server listening");
    }
    axum::serve(listener, router(view))
        .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::codec::JsonCodec;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn live_view() -> (Broker, View<u64>) {
        let broker = Broker::in_memory();
        broker.create_topic("g-table", 2).expect("create");
        broker
            .produce("g-table", "user-0", b"3")
            .await
            .expect("produce");
        let view = View::<u64>::builder(broker.clone())
            .table("g-table", JsonCodec::<u64>::new())
            .open()
            .expect("open");
        view.handle().wait_live().await.expect("live");
        (broker, view)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8(bytes.to_vec()).expect("utf8"))
    }

    #[tokio::test]
    async fn known_key_returns_json_value() {
        let (_broker, view) = live_view().await;
        let (status, body) = get_body(router(view), "/user-0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "3");
    }

    #[tokio::test]
    async fn unknown_key_returns_null() {
        let (_broker, view) = live_view().await;
        let (status, body) = get_body(router(view), "/user-42").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "null");
    }

    #[tokio::test]
    async fn missing_key_returns_null() {
        let (_broker, view) = live_view().await;
        let (status, body) = get_body(router(view), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "null");
    }

    #[tokio::test]
    async fn not_ready_partition_returns_null() {
        let broker = Broker::in_memory();
        broker.create_topic("g-table", 1).expect("create");
        broker
            .produce("g-table", "user-0", b"{not json")
            .await
            .expect("produce poison");
        broker
            .produce("g-table", "user-0", b"3")
            .await
            .expect("produce");
        // Replication halts on the poison record and never goes live.
        let view = View::<u64>::builder(broker)
            .table("g-table", JsonCodec::<u64>::new())
            .poison_policy(crate::quarantine::PoisonPolicy::Fail)
            .open()
            .expect("open");
        assert!(view.handle().join().await.is_err());

        let (status, body) = get_body(router(view), "/user-0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "null");
    }

    #[tokio::test]
    async fn serve_answers_over_tcp_and_shuts_down() {
        let (_broker, view) = live_view().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, view, rx));

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /user-0 HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .expect("write request");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");
        assert!(response.starts_with("HTTP/1.1 200"), "got {response}");
        assert!(response.ends_with("3"), "got {response}");

        tx.send(true).expect("signal shutdown");
        server.await.expect("join").expect("serve ok");
    }
}
