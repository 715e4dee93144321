//! The HTTP/1.1 proxy engine.
//!
//! Accepts TCP clients, parses each exchange into the shared-cell message
//! model, runs the intercept hooks for in-scope traffic, and forwards to
//! the origin server (or through an upstream proxy). CONNECT requests are
//! tunneled blindly without interception.

use std::{net::SocketAddr, sync::Arc};

use http::{HeaderMap, Uri};
use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    message::{
        Body, BodyFraming, Cell, Request, RequestHead, RequestParts, Response, ResponseHead,
        ResponseParts, body_framing,
    },
    proxy::Proxy,
    util::{PeekReader, tunnel_bidi},
};

impl Proxy {
    /// Binds `addr` and serves proxy connections.
    ///
    /// Runs until the listener errors or the task is dropped.
    pub async fn listen_and_serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .std_context("failed to bind proxy listener")?;
        debug!(%addr, "proxy listening");
        self.serve(listener).await
    }

    /// Serves proxy connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tokio::spawn(self.dispatch_intercepts());
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id = 0u64;
        loop {
            let (stream, client_addr) = listener
                .accept()
                .await
                .std_context("failed to accept proxy connection")?;
            let this = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted proxy connection");
                        if let Err(err) = this.handle_connection(stream).await {
                            warn!("error while serving proxy connection: {err:#}");
                        }
                    })
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }
    }

    /// Serves one client connection, exchange by exchange, until either
    /// side asks for close or the client goes away.
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (recv, mut send) = stream.into_split();
        let mut recv = PeekReader::new(recv, HEADER_SECTION_MAX_LENGTH);
        loop {
            let head = match read_request_head(&mut recv).await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    debug!("client closed connection");
                    return Ok(());
                }
                Err(err) => {
                    write_bad_request(&mut send).await;
                    return Err(err);
                }
            };
            if head.method.eq_ignore_ascii_case("CONNECT") {
                return self.serve_tunnel(head, recv, send).await;
            }
            let parsed = async {
                let framing = body_framing(&head.headers)?;
                let body = read_request_body(&mut recv, framing).await?;
                RequestParts::assemble(head, body)
            };
            let request = match parsed.await {
                Ok(parts) => Request::from_parts(parts),
                Err(err) => {
                    write_bad_request(&mut send).await;
                    return Err(err);
                }
            };
            let hooked = self.in_scope(&request.url.get().to_string());
            debug!(url = %request.url.get(), hooked, "read request");

            let intercepted = if hooked {
                self.intercept_request(request.clone()).await
            } else {
                None
            };
            let response = match intercepted {
                Some(dropped) => dropped,
                None => match self.forward_request(&request).await {
                    Ok(response) if hooked => self.intercept_response(response).await,
                    Ok(response) => response,
                    Err(err) => {
                        warn!("failed to forward request: {err:#}");
                        bad_gateway(&request)
                    }
                },
            };

            let wire = response.to_wire()?;
            send.write_all(&wire)
                .await
                .std_context("failed to write response to client")?;
            if request.close.get() || response.close.get() {
                return Ok(());
            }
        }
    }

    /// Forwards the request and reads the full response.
    async fn forward_request(&self, request: &Request) -> Result<Response> {
        let url = request.url.get();
        let (addr, target) = match &self.upstream {
            // An upstream proxy expects the absolute-form target.
            Some(upstream) => (authority_addr(upstream)?, url.to_string()),
            None => {
                let target = url
                    .path_and_query()
                    .map(|pq| pq.as_str().to_owned())
                    .unwrap_or_else(|| "/".to_owned());
                (authority_addr(&url)?, target)
            }
        };
        debug!(%addr, %target, "connecting to origin");
        let stream = TcpStream::connect(&addr)
            .await
            .std_context("failed to connect to origin")?;
        let (recv, mut send) = stream.into_split();

        let wire = request.wire_for_target(&target)?;
        send.write_all(&wire)
            .await
            .std_context("failed to write request to origin")?;

        let mut recv = PeekReader::new(recv, HEADER_SECTION_MAX_LENGTH);
        let head = read_response_head(&mut recv).await?;
        let framing = body_framing(&head.headers)?;
        let (body, content_length) = read_response_body(&mut recv, framing).await?;
        debug!(status = head.code, content_length, "read response");
        Ok(Response::from_parts(
            ResponseParts::assemble(head, body, content_length),
            request.clone(),
        ))
    }

    /// Tunnels a CONNECT request end to end, without interception.
    async fn serve_tunnel(
        &self,
        head: RequestHead,
        mut client_recv: PeekReader<OwnedReadHalf>,
        mut client_send: OwnedWriteHalf,
    ) -> Result<()> {
        let authority = head.target;
        match &self.upstream {
            Some(upstream) => {
                let addr = authority_addr(upstream)?;
                debug!(%addr, %authority, "tunneling CONNECT via upstream");
                let stream = TcpStream::connect(&addr)
                    .await
                    .std_context("failed to connect to upstream proxy")?;
                let (mut origin_recv, mut origin_send) = stream.into_split();
                let connect =
                    format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
                origin_send
                    .write_all(connect.as_bytes())
                    .await
                    .std_context("failed to write CONNECT to upstream proxy")?;
                // The upstream's response flows straight back to the client.
                tunnel_bidi(
                    &mut client_recv,
                    &mut client_send,
                    &mut origin_recv,
                    &mut origin_send,
                )
                .await?;
            }
            None => {
                debug!(%authority, "tunneling CONNECT");
                let stream = match TcpStream::connect(&authority).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        client_send
                            .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                            .await
                            .ok();
                        return Err(err).std_context("failed to connect to tunnel target");
                    }
                };
                client_send
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .std_context("failed to write CONNECT response")?;
                let (mut origin_recv, mut origin_send) = stream.into_split();
                tunnel_bidi(
                    &mut client_recv,
                    &mut client_send,
                    &mut origin_recv,
                    &mut origin_send,
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// The response sent downstream when the origin is unreachable.
fn bad_gateway(request: &Request) -> Response {
    Response {
        status: Cell::new("502 Bad Gateway".to_owned()),
        status_code: Cell::new(502),
        proto: Cell::new("HTTP/1.1".to_owned()),
        close: Cell::new(true),
        headers: Cell::new(HeaderMap::new()),
        content_length: Cell::new(0),
        body: Cell::new(Body::empty()),
        request: request.clone(),
    }
}

async fn write_bad_request(send: &mut (impl AsyncWrite + Unpin)) {
    send.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
        .await
        .ok();
}

/// Resolves a URI to a `host:port` address, defaulting to port 80.
fn authority_addr(uri: &Uri) -> Result<String> {
    let host = uri.host().context("URL without host")?;
    let port = uri.port_u16().unwrap_or(80);
    Ok(format!("{host}:{port}"))
}

/// Reads and parses a request head, returning `None` on a clean EOF
/// before any bytes arrive.
async fn read_request_head(
    recv: &mut PeekReader<impl AsyncRead + Unpin>,
) -> Result<Option<RequestHead>> {
    loop {
        if let Some((len, head)) = RequestHead::parse(recv.peeked())? {
            recv.consume(len);
            return Ok(Some(head));
        }
        ensure_any!(!recv.is_full(), "request header section too large");
        if recv.prefetch().await? == 0 {
            ensure_any!(
                recv.peeked().is_empty(),
                "connection closed mid request head"
            );
            return Ok(None);
        }
    }
}

/// Reads and parses a response head.
async fn read_response_head(
    recv: &mut PeekReader<impl AsyncRead + Unpin>,
) -> Result<ResponseHead> {
    loop {
        if let Some((len, head)) = ResponseHead::parse(recv.peeked())? {
            recv.consume(len);
            return Ok(head);
        }
        ensure_any!(!recv.is_full(), "response header section too large");
        ensure_any!(
            recv.prefetch().await? > 0,
            "connection closed mid response head"
        );
    }
}

async fn read_request_body(
    recv: &mut (impl AsyncRead + Unpin),
    framing: BodyFraming,
) -> Result<Vec<u8>> {
    match framing {
        BodyFraming::Length(n) => read_sized_body(recv, n).await,
        BodyFraming::Chunked => read_chunked_body(recv).await,
        BodyFraming::Unframed => Ok(Vec::new()),
    }
}

/// Reads a response body; unframed bodies are close-delimited and report a
/// negative content length.
async fn read_response_body(
    recv: &mut (impl AsyncRead + Unpin),
    framing: BodyFraming,
) -> Result<(Vec<u8>, i64)> {
    match framing {
        BodyFraming::Length(n) => Ok((read_sized_body(recv, n).await?, n as i64)),
        BodyFraming::Chunked => {
            let body = read_chunked_body(recv).await?;
            let len = body.len() as i64;
            Ok((body, len))
        }
        BodyFraming::Unframed => {
            let mut body = Vec::new();
            recv.read_to_end(&mut body)
                .await
                .std_context("failed to read close-delimited body")?;
            Ok((body, -1))
        }
    }
}

async fn read_sized_body(recv: &mut (impl AsyncRead + Unpin), len: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(len).std_context("Content-Length too large")?;
    let mut body = vec![0u8; len];
    recv.read_exact(&mut body)
        .await
        .std_context("truncated message body")?;
    Ok(body)
}

async fn read_chunked_body(recv: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line = read_crlf_line(recv).await?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).std_context("invalid chunk size")?;
        if size == 0 {
            // Discard trailers up to the terminating blank line.
            loop {
                if read_crlf_line(recv).await?.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        let start = body.len();
        body.resize(start + size, 0);
        recv.read_exact(&mut body[start..])
            .await
            .std_context("truncated chunk data")?;
        let mut crlf = [0u8; 2];
        recv.read_exact(&mut crlf)
            .await
            .std_context("truncated chunk terminator")?;
        ensure_any!(&crlf == b"\r\n", "missing chunk terminator");
    }
}

/// Reads one CRLF-terminated line byte by byte, so nothing beyond the line
/// is consumed from the stream.
async fn read_crlf_line(recv: &mut (impl AsyncRead + Unpin)) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = recv.read_u8().await.std_context("truncated chunk line")?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        ensure_any!(line.len() <= 256, "chunk line too long");
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).std_context("invalid chunk line")
}
