use std::{net::SocketAddr, sync::Arc, time::Duration};

use http::StatusCode;
use n0_error::{Result, StackResultExt, StdResultExt};
use n0_future::task::AbortOnDropHandle;
use n0_tracing_test::traced_test;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::debug;

use crate::{
    DROPPED_BODY, Proxy,
    fs::Node,
    message::ResponseHead,
    util::PeekReader,
};

// -- Test helpers --

/// Spawns the proxy on an ephemeral port and returns its control tree root.
async fn spawn_proxy(scope: &str) -> Result<(Arc<Proxy>, SocketAddr, Node, AbortOnDropHandle<Result<()>>)> {
    let proxy = Arc::new(Proxy::new(scope)?);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let root = proxy.root();
    debug!(%addr, "spawned proxy");
    let task = tokio::spawn(proxy.clone().serve(listener));
    Ok((proxy, addr, root, AbortOnDropHandle::new(task)))
}

/// Spawns an HTTP origin server that echoes back "{label} {method} {path}: {body}".
async fn spawn_origin(label: &'static str) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    debug!(%label, %addr, "spawned origin server");
    let task = tokio::spawn(async move { origin_server::run(listener, label).await });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a raw TCP echo server.
async fn spawn_echo_server() -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// A reqwest client routing everything through the proxy at `addr`.
fn proxy_client(addr: SocketAddr) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{addr}")).anyerr()?)
        .build()
        .anyerr()
}

/// Polls `condition` until it holds or a few seconds pass.
async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Walks `segments` down from `root`.
fn node_at(root: &Node, segments: &[&str]) -> Node {
    let mut node = root.clone();
    for segment in segments {
        node = node.lookup(segment).unwrap_or_else(|_| panic!("missing node {segment}"));
    }
    node
}

fn queue_len(queue: &crate::SharedQueue) -> usize {
    queue.read().unwrap().len()
}

// -- Tests --

/// Out-of-scope traffic passes through without ever touching the queues.
#[tokio::test]
#[traced_test]
async fn test_out_of_scope_passthrough() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin").await?;
    let (proxy, proxy_addr, root, _proxy_task) = spawn_proxy("never-matches-anything").await?;
    node_at(&root, &["intreq"]).write_all(b"1").unwrap();

    let client = proxy_client(proxy_addr)?;
    let res = client
        .get(format!("http://{origin_addr}/plain"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "origin GET /plain: ");
    assert_eq!(queue_len(proxy.requests()), 0);
    assert_eq!(queue_len(proxy.responses()), 0);
    Ok(())
}

/// A held request appears under /req/0 and is released by writing to its
/// forward file.
#[tokio::test]
#[traced_test]
async fn test_forward_releases_held_request() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin").await?;
    let (proxy, proxy_addr, root, _proxy_task) = spawn_proxy(".").await?;
    node_at(&root, &["intreq"]).write_all(b"1").unwrap();

    let client = proxy_client(proxy_addr)?;
    let request = tokio::spawn({
        let url = format!("http://{origin_addr}/held");
        async move { client.get(&url).send().await?.text().await }
    });

    let requests = proxy.requests().clone();
    wait_for("request to queue", || queue_len(&requests) == 1).await;
    let held = node_at(&root, &["req", "0"]);
    assert_eq!(node_at(&held, &["method"]).read_all().unwrap(), b"GET");

    node_at(&held, &["forward"]).write_all(b"1").unwrap();
    assert_eq!(request.await.anyerr()?.anyerr()?, "origin GET /held: ");
    wait_for("queue to drain", || queue_len(&requests) == 0).await;
    Ok(())
}

/// Removing a held response's directory replaces it with the synthetic 500.
#[tokio::test]
#[traced_test]
async fn test_drop_yields_synthetic_500() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin").await?;
    let (proxy, proxy_addr, root, _proxy_task) = spawn_proxy(".").await?;
    node_at(&root, &["intresp"]).write_all(b"1").unwrap();

    let client = proxy_client(proxy_addr)?;
    let request = tokio::spawn({
        let url = format!("http://{origin_addr}/doomed");
        async move { client.get(&url).send().await }
    });

    let responses = proxy.responses().clone();
    wait_for("response to queue", || queue_len(&responses) == 1).await;
    node_at(&root, &["resp"]).remove("0").unwrap();

    let res = request.await.anyerr()?.anyerr()?;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        res.headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok()),
        Some("18")
    );
    assert_eq!(res.text().await.anyerr()?, DROPPED_BODY);
    Ok(())
}

/// Turning interception off releases every queued request.
#[tokio::test]
#[traced_test]
async fn test_intercept_off_flushes_queue() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin").await?;
    let (proxy, proxy_addr, root, _proxy_task) = spawn_proxy(".").await?;
    node_at(&root, &["intreq"]).write_all(b"1").unwrap();

    let mut requests = Vec::new();
    for i in 0..3 {
        let client = proxy_client(proxy_addr)?;
        let url = format!("http://{origin_addr}/flush/{i}");
        requests.push(tokio::spawn(async move {
            client.get(&url).send().await?.text().await
        }));
    }
    let queue = proxy.requests().clone();
    wait_for("all requests to queue", || queue_len(&queue) == 3).await;

    node_at(&root, &["intreq"]).write_all(b"0").unwrap();
    for (i, request) in requests.into_iter().enumerate() {
        assert_eq!(
            request.await.anyerr()?.anyerr()?,
            format!("origin GET /flush/{i}: ")
        );
    }
    wait_for("queue to drain", || queue_len(&queue) == 0).await;
    Ok(())
}

/// Editing a held request's body updates contentlength and what the origin
/// receives.
#[tokio::test]
#[traced_test]
async fn test_body_edit_updates_length() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin").await?;
    let (proxy, proxy_addr, root, _proxy_task) = spawn_proxy(".").await?;
    node_at(&root, &["intreq"]).write_all(b"1").unwrap();

    let client = proxy_client(proxy_addr)?;
    let request = tokio::spawn({
        let url = format!("http://{origin_addr}/upload");
        async move { client.post(&url).body("abc").send().await?.text().await }
    });

    let requests = proxy.requests().clone();
    wait_for("request to queue", || queue_len(&requests) == 1).await;
    let held = node_at(&root, &["req", "0"]);
    assert_eq!(node_at(&held, &["body"]).read_all().unwrap(), b"abc");

    node_at(&held, &["body"]).write_all(b"longer body\n").unwrap();
    assert_eq!(node_at(&held, &["contentlength"]).read_all().unwrap(), b"11");
    assert_eq!(node_at(&held, &["body"]).read_all().unwrap(), b"longer body");

    node_at(&held, &["forward"]).write_all(b"go").unwrap();
    assert_eq!(
        request.await.anyerr()?.anyerr()?,
        "origin POST /upload: longer body"
    );
    Ok(())
}

/// Editing a held response's status line changes what the client sees.
#[tokio::test]
#[traced_test]
async fn test_status_edit_on_held_response() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin").await?;
    let (proxy, proxy_addr, root, _proxy_task) = spawn_proxy(".").await?;
    node_at(&root, &["intresp"]).write_all(b"1").unwrap();

    let client = proxy_client(proxy_addr)?;
    let request = tokio::spawn({
        let url = format!("http://{origin_addr}/teapot");
        async move { client.get(&url).send().await }
    });

    let responses = proxy.responses().clone();
    wait_for("response to queue", || queue_len(&responses) == 1).await;
    let held = node_at(&root, &["resp", "0"]);
    // The nested req/ view reaches back to the owning request.
    assert_eq!(
        node_at(&held, &["req", "requrl"]).read_all().unwrap(),
        b"/teapot"
    );
    node_at(&held, &["status"]).write_all(b"418 I'm a teapot\n").unwrap();
    node_at(&held, &["forward"]).write_all(b"1").unwrap();

    let res = request.await.anyerr()?.anyerr()?;
    assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
    Ok(())
}

/// CONNECT requests are tunneled end to end without interception.
#[tokio::test]
#[traced_test]
async fn test_connect_tunnel() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (proxy, proxy_addr, root, _proxy_task) = spawn_proxy(".").await?;
    node_at(&root, &["intreq"]).write_all(b"1").unwrap();

    let stream = TcpStream::connect(proxy_addr).await?;
    let (recv, mut send) = stream.into_split();
    let connect = format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n");
    send.write_all(connect.as_bytes()).await?;

    let mut recv = PeekReader::new(recv, 8192);
    let head = loop {
        if let Some((len, head)) = ResponseHead::parse(recv.peeked())? {
            recv.consume(len);
            break head;
        }
        recv.prefetch().await?;
    };
    assert_eq!(head.code, 200);

    send.write_all(b"hello tunnel").await?;
    send.shutdown().await?;
    let mut echoed = Vec::new();
    recv.read_to_end(&mut echoed).await?;
    assert_eq!(echoed, b"hello tunnel");
    // Tunnels never touch the intercept queues.
    assert_eq!(queue_len(proxy.requests()), 0);
    Ok(())
}

/// Garbage on the wire is answered with 400 Bad Request.
#[tokio::test]
#[traced_test]
async fn test_invalid_request_gets_400() -> Result {
    let (_proxy, proxy_addr, _root, _proxy_task) = spawn_proxy(".").await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(b"NOT VALID HTTP\r\n\r\n").await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let (_, head) = ResponseHead::parse(&buf)?.context("incomplete response")?;
    assert_eq!(head.code, 400);
    Ok(())
}

/// The scope file rejects bad patterns and keeps the previous one.
#[tokio::test]
#[traced_test]
async fn test_scope_file_rejects_bad_pattern() -> Result {
    let (_proxy, _proxy_addr, root, _proxy_task) = spawn_proxy("^http://in-scope").await?;
    let scope = node_at(&root, &["scope"]);
    assert!(scope.write_all(b"[").is_err());
    assert_eq!(scope.read_all().unwrap(), b"^http://in-scope");
    scope.write_all(b"^http://other\n").unwrap();
    assert_eq!(scope.read_all().unwrap(), b"^http://other");
    Ok(())
}

mod origin_server {
    use std::{convert::Infallible, sync::Arc};

    use http_body_util::{BodyExt, Full};
    use hyper::{Request, Response, body::Bytes, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Returns "{label} {METHOD} {PATH}: {BODY}" as response body.
    pub(super) async fn run(listener: TcpListener, label: &'static str) {
        let label = Arc::new(label);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let label = label.clone();
            tokio::task::spawn(async move {
                let handler = move |req: Request<hyper::body::Incoming>| {
                    let label = label.clone();
                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_string();
                        let body_bytes = req.collect().await.unwrap().to_bytes();
                        let body_str = String::from_utf8_lossy(&body_bytes);
                        let response = format!("{} {} {}: {}", *label, method, path, body_str);
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(response))))
                    }
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }
}
