//! The shared-cell message model and its wire codec.
//!
//! Every field of an in-flight request or response lives in its own [`Cell`];
//! the proxy engine and the filesystem nodes hold clones of the same cells,
//! so a mutation through either side is observed by all. The wire codec is
//! used both by the engine when forwarding and by the `raw` files when an
//! operator reads or replaces a whole message.

use std::{
    fmt,
    io::{self, Cursor, Read},
    str::FromStr,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use http::{HeaderMap, HeaderName, HeaderValue, Uri, header};
use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};

/// Shared mutable cell behind a reader-writer lock.
///
/// Many simultaneous readers, exclusive writers. The handle is stable for
/// the lifetime of every clone; ownership ends when the last clone drops.
pub struct Cell<T>(Arc<RwLock<T>>);

impl<T> Cell<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Locks the cell for shared reading.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().expect("cell lock poisoned")
    }

    /// Locks the cell for exclusive writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().expect("cell lock poisoned")
    }

    /// Replaces the current value.
    pub fn set(&self, value: T) {
        *self.write() = value;
    }
}

impl<T: Clone> Cell<T> {
    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.read().clone()
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Default> Default for Cell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(guard) => write!(f, "Cell({:?})", &*guard),
            Err(_) => write!(f, "Cell(<locked>)"),
        }
    }
}

/// A restartable byte stream backing a message body.
///
/// Draining reads the underlying reader to the end and re-arms the stream
/// over the drained bytes, so the engine (and any later reader) always sees
/// the full body again.
#[derive(derive_more::Debug)]
pub struct Body {
    #[debug(skip)]
    reader: Box<dyn Read + Send + Sync>,
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// A body over an in-memory buffer.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            reader: Box::new(Cursor::new(bytes.into())),
        }
    }

    /// A body over an arbitrary reader.
    ///
    /// Note: the reader is consumed on the first drain and replaced by a
    /// buffered stream over its bytes.
    pub fn from_reader(reader: impl Read + Send + Sync + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    /// Reads the stream to the end, re-arms it, and returns the bytes.
    pub fn drain(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf)?;
        self.reader = Box::new(Cursor::new(buf.clone()));
        Ok(buf)
    }

    /// Replaces the stream with a fresh one over `bytes`.
    pub fn replace(&mut self, bytes: Vec<u8>) {
        self.reader = Box::new(Cursor::new(bytes));
    }

    /// Returns the length of the currently buffered body.
    pub fn len(&mut self) -> io::Result<usize> {
        Ok(self.drain()?.len())
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

/// One HTTP request in flight through the proxy.
///
/// Cloning clones the cell handles, not the values: a clone is another
/// pointer into the same in-flight message.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method, e.g. `GET`.
    pub method: Cell<String>,
    /// Full URL including scheme.
    pub url: Cell<Uri>,
    /// Request target exactly as it appeared on the request line.
    pub request_uri: Cell<String>,
    /// Protocol string, e.g. `HTTP/1.1`.
    pub proto: Cell<String>,
    /// Whether the connection closes after this exchange.
    pub close: Cell<bool>,
    /// Authority from the Host header or the absolute request target.
    pub host: Cell<String>,
    /// Header map with framing headers (Host, Content-Length,
    /// Transfer-Encoding, Connection) lifted into their own fields.
    pub headers: Cell<HeaderMap>,
    /// Body length; negative when unknown.
    pub content_length: Cell<i64>,
    /// Restartable body stream.
    pub body: Cell<Body>,
}

/// One HTTP response in flight through the proxy, with its owning request.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status string, e.g. `200 OK`.
    pub status: Cell<String>,
    /// Numeric status code.
    pub status_code: Cell<i32>,
    /// Protocol string, e.g. `HTTP/1.1`.
    pub proto: Cell<String>,
    /// Whether the connection closes after this exchange.
    pub close: Cell<bool>,
    /// Header map, framing headers lifted out as for [`Request`].
    pub headers: Cell<HeaderMap>,
    /// Body length; `-1` for close-delimited responses.
    pub content_length: Cell<i64>,
    /// Restartable body stream.
    pub body: Cell<Body>,
    /// The request this response answers.
    pub request: Request,
}

/// Parsed request line and header section.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) proto: String,
    pub(crate) headers: HeaderMap,
}

/// Parsed status line and header section.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) proto: String,
    pub(crate) code: u16,
    pub(crate) reason: String,
    pub(crate) headers: HeaderMap,
}

/// How the message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// Exactly this many bytes follow the header section.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// No framing declared; empty for requests, close-delimited for
    /// responses.
    Unframed,
}

impl RequestHead {
    /// Parses a request head from a buffer, returning `None` when more data
    /// is needed. On success also returns the header section length.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request head")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method = req.method.context("missing HTTP method")?.to_string();
                let target = req.path.context("missing request target")?.to_string();
                let proto = version_string(req.version.context("missing HTTP version")?);
                let headers = collect_headers(req.headers);
                Ok(Some((
                    header_len,
                    Self {
                        method,
                        target,
                        proto,
                        headers,
                    },
                )))
            }
        }
    }
}

impl ResponseHead {
    /// Parses a response head from a buffer, returning `None` when more data
    /// is needed. On success also returns the header section length.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response head")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("missing response status code")?;
                let reason = res.reason.unwrap_or_default().to_string();
                let proto = version_string(res.version.context("missing HTTP version")?);
                let headers = collect_headers(res.headers);
                Ok(Some((
                    header_len,
                    Self {
                        proto,
                        code,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Status string in `"200 OK"` form.
    pub(crate) fn status_string(&self) -> String {
        if self.reason.is_empty() {
            self.code.to_string()
        } else {
            format!("{} {}", self.code, self.reason)
        }
    }
}

fn version_string(minor: u8) -> String {
    format!("HTTP/1.{minor}")
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    HeaderMap::from_iter(parsed.iter().flat_map(|h| {
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        Some((name, value))
    }))
}

/// Determines body framing from a header section.
///
/// Transfer-Encoding wins over Content-Length per RFC 9112.
pub(crate) fn body_framing(headers: &HeaderMap) -> Result<BodyFraming> {
    if let Some(te) = headers.get(header::TRANSFER_ENCODING) {
        let te = te.to_str().std_context("invalid Transfer-Encoding")?;
        ensure_any!(
            te.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked")),
            "unsupported transfer coding {te:?}"
        );
        return Ok(BodyFraming::Chunked);
    }
    if let Some(cl) = headers.get(header::CONTENT_LENGTH) {
        let cl = cl.to_str().std_context("invalid Content-Length")?;
        let n: u64 = cl.trim().parse().std_context("invalid Content-Length")?;
        return Ok(BodyFraming::Length(n));
    }
    Ok(BodyFraming::Unframed)
}

/// Decodes a complete chunked body, returning the bytes and the number of
/// input bytes consumed. Chunk extensions and trailers are discarded.
pub(crate) fn decode_chunked(input: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = find_crlf(&input[pos..]).context("truncated chunk size line")?;
        let line = std::str::from_utf8(&input[pos..pos + line_end])
            .std_context("invalid chunk size line")?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).std_context("invalid chunk size")?;
        pos += line_end + 2;
        if size == 0 {
            // Skip trailers up to the terminating blank line.
            loop {
                let line_end = find_crlf(&input[pos..]).context("truncated chunk trailer")?;
                pos += line_end + 2;
                if line_end == 0 {
                    break;
                }
            }
            return Ok((out, pos));
        }
        ensure_any!(input.len() >= pos + size + 2, "truncated chunk data");
        out.extend_from_slice(&input[pos..pos + size]);
        pos += size;
        ensure_any!(&input[pos..pos + 2] == b"\r\n", "missing chunk terminator");
        pos += 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Lifts the Connection header into a close flag.
///
/// HTTP/1.0 defaults to close unless keep-alive is requested.
fn connection_close(headers: &mut HeaderMap, proto: &str) -> bool {
    let mut close = proto.eq_ignore_ascii_case("HTTP/1.0");
    if let Some(value) = headers.remove(header::CONNECTION)
        && let Ok(value) = value.to_str()
    {
        for token in value.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                close = false;
            }
        }
    }
    close
}

fn strip_framing_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
}

/// Field values for a fully parsed request, before they land in cells.
pub(crate) struct RequestParts {
    method: String,
    url: Uri,
    request_uri: String,
    proto: String,
    close: bool,
    host: String,
    headers: HeaderMap,
    content_length: i64,
    body: Vec<u8>,
}

impl RequestParts {
    /// Assembles parts from a parsed head and an already-read body.
    pub(crate) fn assemble(head: RequestHead, body: Vec<u8>) -> Result<Self> {
        let RequestHead {
            method,
            target,
            proto,
            mut headers,
        } = head;
        let host_header = headers
            .remove(header::HOST)
            .and_then(|v| v.to_str().ok().map(ToOwned::to_owned));
        let url = Uri::from_str(&target).std_context("invalid request target")?;
        let (url, host) = if url.scheme().is_some() {
            let host = url
                .authority()
                .context("absolute request target without authority")?
                .to_string();
            (url, host)
        } else {
            let host = host_header.context("origin-form request without Host header")?;
            let url = Uri::from_str(&format!("http://{host}{target}"))
                .std_context("invalid request URL")?;
            (url, host)
        };
        let close = connection_close(&mut headers, &proto);
        strip_framing_headers(&mut headers);
        let content_length = body.len() as i64;
        Ok(Self {
            method,
            url,
            request_uri: target,
            proto,
            close,
            host,
            headers,
            content_length,
            body,
        })
    }

    /// Parses a complete wire-form request, body included.
    ///
    /// A request with no declared body framing gets an empty body; the
    /// remainder after a Content-Length body is ignored.
    pub(crate) fn parse_wire(data: &[u8]) -> Result<Self> {
        let (header_len, head) =
            RequestHead::parse(data)?.context("incomplete request header section")?;
        let rest = &data[header_len..];
        let body = match body_framing(&head.headers)? {
            BodyFraming::Length(n) => {
                let n = usize::try_from(n).std_context("Content-Length too large")?;
                ensure_any!(rest.len() >= n, "request body shorter than Content-Length");
                rest[..n].to_vec()
            }
            BodyFraming::Chunked => decode_chunked(rest)?.0,
            BodyFraming::Unframed => Vec::new(),
        };
        Self::assemble(head, body)
    }
}

impl Request {
    pub(crate) fn from_parts(parts: RequestParts) -> Self {
        Self {
            method: Cell::new(parts.method),
            url: Cell::new(parts.url),
            request_uri: Cell::new(parts.request_uri),
            proto: Cell::new(parts.proto),
            close: Cell::new(parts.close),
            host: Cell::new(parts.host),
            headers: Cell::new(parts.headers),
            content_length: Cell::new(parts.content_length),
            body: Cell::new(Body::from_bytes(parts.body)),
        }
    }

    /// Parses a complete wire-form request into a fresh message.
    pub fn parse_wire(data: &[u8]) -> Result<Self> {
        Ok(Self::from_parts(RequestParts::parse_wire(data)?))
    }

    /// Replaces this message's fields with those parsed from `data`.
    ///
    /// Every value is written through the existing cells, so other pointers
    /// into this message observe the new values.
    pub fn replace_from_wire(&self, data: &[u8]) -> Result<()> {
        let parts = RequestParts::parse_wire(data)?;
        self.method.set(parts.method);
        self.url.set(parts.url);
        self.request_uri.set(parts.request_uri);
        self.proto.set(parts.proto);
        self.close.set(parts.close);
        self.host.set(parts.host);
        self.headers.set(parts.headers);
        self.body.write().replace(parts.body);
        self.content_length.set(parts.content_length);
        Ok(())
    }

    /// Serializes to wire form using the original request target.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let target = self.request_uri.get();
        self.wire_for_target(&target)
    }

    /// Serializes to wire form with the given request target.
    ///
    /// The engine picks origin-form or absolute-form here depending on
    /// whether it talks to the origin directly or through an upstream proxy.
    pub(crate) fn wire_for_target(&self, target: &str) -> Result<Vec<u8>> {
        let body = self
            .body
            .write()
            .drain()
            .std_context("failed to drain request body")?;
        let mut out = Vec::with_capacity(256 + body.len());
        out.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.method.read(),
                target,
                self.proto.read()
            )
            .as_bytes(),
        );
        let host = self.host.get();
        if !host.is_empty() {
            out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
        }
        write_headers(&mut out, &self.headers.read());
        if !body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        if *self.close.read() {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Field values for a fully parsed response.
pub(crate) struct ResponseParts {
    status: String,
    status_code: i32,
    proto: String,
    close: bool,
    headers: HeaderMap,
    content_length: i64,
    body: Vec<u8>,
}

impl ResponseParts {
    /// Assembles parts from a parsed head and an already-read body.
    ///
    /// `content_length` is negative when the body was close-delimited.
    pub(crate) fn assemble(head: ResponseHead, body: Vec<u8>, content_length: i64) -> Self {
        let status = head.status_string();
        let ResponseHead {
            proto,
            code,
            mut headers,
            ..
        } = head;
        let mut close = connection_close(&mut headers, &proto);
        if content_length < 0 {
            close = true;
        }
        strip_framing_headers(&mut headers);
        Self {
            status,
            status_code: code as i32,
            proto,
            close,
            headers,
            content_length,
            body,
        }
    }

    /// Parses a complete wire-form response, body included.
    pub(crate) fn parse_wire(data: &[u8]) -> Result<Self> {
        let (header_len, head) =
            ResponseHead::parse(data)?.context("incomplete response header section")?;
        let rest = &data[header_len..];
        let (body, content_length) = match body_framing(&head.headers)? {
            BodyFraming::Length(n) => {
                let n = usize::try_from(n).std_context("Content-Length too large")?;
                ensure_any!(rest.len() >= n, "response body shorter than Content-Length");
                (rest[..n].to_vec(), n as i64)
            }
            BodyFraming::Chunked => {
                let (body, _) = decode_chunked(rest)?;
                let len = body.len() as i64;
                (body, len)
            }
            BodyFraming::Unframed => (rest.to_vec(), -1),
        };
        Ok(Self::assemble(head, body, content_length))
    }
}

impl Response {
    pub(crate) fn from_parts(parts: ResponseParts, request: Request) -> Self {
        Self {
            status: Cell::new(parts.status),
            status_code: Cell::new(parts.status_code),
            proto: Cell::new(parts.proto),
            close: Cell::new(parts.close),
            headers: Cell::new(parts.headers),
            content_length: Cell::new(parts.content_length),
            body: Cell::new(Body::from_bytes(parts.body)),
            request,
        }
    }

    /// Parses a complete wire-form response bound to its owning request.
    pub fn parse_wire(data: &[u8], request: Request) -> Result<Self> {
        Ok(Self::from_parts(ResponseParts::parse_wire(data)?, request))
    }

    /// Replaces this message's fields with those parsed from `data`.
    ///
    /// The parse stays bound to the owning request; every value is written
    /// through the existing cells.
    pub fn replace_from_wire(&self, data: &[u8]) -> Result<()> {
        let parts = ResponseParts::parse_wire(data)?;
        self.status.set(parts.status);
        self.status_code.set(parts.status_code);
        self.proto.set(parts.proto);
        self.close.set(parts.close);
        self.headers.set(parts.headers);
        self.body.write().replace(parts.body);
        self.content_length.set(parts.content_length);
        Ok(())
    }

    /// Serializes to wire form, body included.
    ///
    /// Content-Length is always emitted from the drained body so the frame
    /// stays consistent after body edits, whatever the cell currently says.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let body = self
            .body
            .write()
            .drain()
            .std_context("failed to drain response body")?;
        let mut out = Vec::with_capacity(256 + body.len());
        out.extend_from_slice(
            format!("{} {}\r\n", self.proto.read(), self.status.read()).as_bytes(),
        );
        write_headers(&mut out, &self.headers.read());
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        if *self.close.read() {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        if name == header::HOST {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(wire: &str) -> Request {
        Request::parse_wire(wire.as_bytes()).unwrap()
    }

    #[test]
    fn body_drain_is_restartable() {
        let mut body = Body::from_reader(Cursor::new(b"hello".to_vec()));
        assert_eq!(body.drain().unwrap(), b"hello");
        assert_eq!(body.drain().unwrap(), b"hello");
        body.replace(b"other".to_vec());
        assert_eq!(body.drain().unwrap(), b"other");
        assert_eq!(body.len().unwrap(), 5);
    }

    #[test]
    fn parse_origin_form_request() {
        let req = request(
            "POST /submit?q=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\nUser-Agent: curl\r\n\r\nabc",
        );
        assert_eq!(req.method.get(), "POST");
        assert_eq!(req.request_uri.get(), "/submit?q=1");
        assert_eq!(req.url.get().to_string(), "http://example.com/submit?q=1");
        assert_eq!(req.host.get(), "example.com");
        assert_eq!(req.content_length.get(), 3);
        assert_eq!(req.body.write().drain().unwrap(), b"abc");
        // Framing headers are lifted out of the map.
        let headers = req.headers.get();
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get(header::HOST).is_none());
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "curl");
    }

    #[test]
    fn parse_absolute_form_request() {
        let req = request("GET http://example.com:8080/x HTTP/1.1\r\nHost: ignored\r\n\r\n");
        assert_eq!(req.host.get(), "example.com:8080");
        assert_eq!(req.url.get().to_string(), "http://example.com:8080/x");
        assert_eq!(req.request_uri.get(), "http://example.com:8080/x");
    }

    #[test]
    fn connection_close_flags() {
        let req = request("GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n");
        assert!(req.close.get());
        let req = request("GET / HTTP/1.0\r\nHost: a\r\n\r\n");
        assert!(req.close.get());
        let req = request("GET / HTTP/1.0\r\nHost: a\r\nConnection: keep-alive\r\n\r\n");
        assert!(!req.close.get());
    }

    #[test]
    fn request_wire_round_trip_is_stable() {
        let req = request(
            "POST /api HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\nContent-Length: 4\r\n\r\nwire",
        );
        let dump = req.to_wire().unwrap();
        let again = Request::parse_wire(&dump).unwrap();
        assert_eq!(again.to_wire().unwrap(), dump);
    }

    #[test]
    fn replace_from_wire_updates_existing_cells() {
        let req = request("GET /old HTTP/1.1\r\nHost: old.example\r\n\r\n");
        let method = req.method.clone();
        req.replace_from_wire(b"PUT /new HTTP/1.1\r\nHost: new.example\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        // External pointers into the message observe the new values.
        assert_eq!(method.get(), "PUT");
        assert_eq!(req.host.get(), "new.example");
        assert_eq!(req.body.write().drain().unwrap(), b"hi");
        assert_eq!(req.content_length.get(), 2);
    }

    #[test]
    fn malformed_wire_is_rejected() {
        assert!(Request::parse_wire(b"NOT HTTP AT ALL").is_err());
        assert!(Request::parse_wire(b"GET / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nshort").is_err());
    }

    #[test]
    fn decode_chunked_body() {
        let input = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nTRAILING";
        let (body, consumed) = decode_chunked(input).unwrap();
        assert_eq!(body, b"Wikipedia");
        assert_eq!(consumed, input.len() - "TRAILING".len());
    }

    #[test]
    fn decode_chunked_rejects_truncation() {
        assert!(decode_chunked(b"4\r\nWi").is_err());
        assert!(decode_chunked(b"zz\r\n\r\n").is_err());
    }

    #[test]
    fn parse_chunked_response() {
        let req = request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let resp = Response::parse_wire(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
            req,
        )
        .unwrap();
        assert_eq!(resp.status.get(), "200 OK");
        assert_eq!(resp.status_code.get(), 200);
        assert_eq!(resp.body.write().drain().unwrap(), b"abc");
        assert_eq!(resp.content_length.get(), 3);
        // The coding was decoded, so the header must not survive.
        assert!(resp.headers.get().get(header::TRANSFER_ENCODING).is_none());
    }

    #[test]
    fn close_delimited_response_has_negative_length() {
        let req = request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let resp = Response::parse_wire(b"HTTP/1.1 200 OK\r\n\r\neverything", req).unwrap();
        assert_eq!(resp.content_length.get(), -1);
        assert!(resp.close.get());
        assert_eq!(resp.body.write().drain().unwrap(), b"everything");
    }

    #[test]
    fn response_wire_uses_drained_body_length() {
        let req = request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let resp = Response::parse_wire(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc", req)
            .unwrap();
        resp.body.write().replace(b"a longer body".to_vec());
        let wire = resp.to_wire().unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("a longer body"));
    }
}
