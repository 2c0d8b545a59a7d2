//! The client-side framing protocol (spec §4.1): one netstring-framed
//! exchange over a UNIX-domain socket connected to a single worker.

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::future::poll_fn;
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use http_body::Body as HttpBody;
use pin_project_lite::pin_project;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::env::{build_env, fold_response_headers};
use crate::error::{Error, Result};
use crate::netstring::{Frame, NetstringCodec};

/// A boxed outbound request body: any [`http_body::Body`] whose data
/// chunks are [`Bytes`] and whose errors are this crate's [`Error`].
///
/// [`crate::worker::ProxyRequest::body`] carries one of these so an
/// embedding HTTP server's own request-body type only has to be adapted
/// once, at the call site, rather than threaded generically through the
/// worker and pool.
pub type BoxBody = Pin<Box<dyn HttpBody<Data = Bytes, Error = Error> + Send>>;

/// The writable half of an [`Exchange`]: the outbound request environment
/// and body frames.
#[derive(Debug)]
pub struct RequestWriter {
    sink: FramedWrite<tokio::net::unix::OwnedWriteHalf, NetstringCodec>,
    ended: bool,
}

impl RequestWriter {
    /// Write one request-body chunk.
    ///
    /// Returns an error if `end` has already been called.
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if self.ended {
            return Err(Error::new_invalid_state());
        }
        self.sink.send(chunk).await
    }

    /// Write a final chunk (if any) and the zero-length sentinel, marking
    /// the exchange non-writable outbound.
    pub async fn end(&mut self, last: Option<Bytes>) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        if let Some(chunk) = last {
            self.sink.send(chunk).await?;
        }
        self.sink.send(Bytes::new()).await?;
        self.ended = true;
        Ok(())
    }

    /// Whether `end` has already been called.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Pump a full request body into the writer, then write the
    /// zero-length sentinel that ends the exchange outbound.
    ///
    /// This is spec §4.1's `proxyRequest` convenience folded into the
    /// writer itself: `None` behaves like a body with no chunks, so a
    /// GET/HEAD request can call this the same way a POST/PUT does.
    pub async fn write_body(&mut self, body: Option<BoxBody>) -> Result<()> {
        if let Some(mut body) = body {
            loop {
                match poll_fn(|cx| body.as_mut().poll_data(cx)).await {
                    Some(Ok(chunk)) => self.write(chunk).await?,
                    Some(Err(err)) => return Err(err),
                    None => break,
                }
            }
        }
        self.end(None).await
    }
}

/// The parsed response head: status code and folded header map (spec §4.1
/// inbound rules 1-2).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP status code returned by the worker.
    pub status: u16,
    /// Header map, with embedded-newline values folded into repeated
    /// `K: V` entries.
    pub headers: HeaderMap,
}

pin_project! {
    /// The event-emitting half of an [`Exchange`]: the inbound status,
    /// headers, and body chunks.
    ///
    /// Implements both [`futures_core::Stream`] (used internally to drain
    /// the body after [`read_response_head`]) and [`http_body::Body`], so
    /// an embedding `hyper` server can hand a [`ResponseBody`] straight to
    /// its own response without an adapter — spec §4.1's `proxyRequest`
    /// convenience.
    #[derive(Debug)]
    pub struct ResponseBody {
        #[pin]
        stream: FramedRead<tokio::net::unix::OwnedReadHalf, NetstringCodec>,
        done: bool,
    }
}

impl ResponseBody {
    async fn next_frame(&mut self) -> Result<Frame> {
        match self.stream.next().await {
            Some(frame) => frame,
            None => Err(Error::new_connection_lost()),
        }
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        match this.stream.poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if frame.is_sentinel() {
                    *this.done = true;
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(frame.0)))
                }
            }
            Poll::Ready(Some(Err(err))) => {
                *this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                *this.done = true;
                Poll::Ready(Some(Err(Error::new_connection_lost())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data>>> {
        Stream::poll_next(self, cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>>> {
        Poll::Ready(Ok(None))
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}

/// One request/response traversal of a worker socket (spec's `Exchange`).
///
/// Constructed by [`Client::connect`]. The [`RequestWriter`] and
/// [`ResponseBody`] halves can be driven concurrently: writing the request
/// body does not block reading the response, matching the protocol's
/// full-duplex framing.
#[derive(Debug)]
pub struct Exchange {
    /// The writable half: `write`/`end`.
    pub writer: RequestWriter,
    /// The event-emitting half: read the head, then stream the body.
    pub body: ResponseBody,
}

/// A connected framing client bound to one worker socket.
#[derive(Debug)]
pub struct Client;

impl Client {
    /// Open a stream connection to a worker socket and start one exchange,
    /// writing the environment-map frame immediately.
    ///
    /// Corresponds to spec §4.1's `request(method, path, headers, meta)`.
    /// `Client::connect` performs the underlying connect itself (rather
    /// than queueing writes until some later connect completes); see
    /// DESIGN.md for why this collapses spec's "queue until open" behavior
    /// into ordinary `async`/`await` sequencing.
    pub async fn request(
        socket_path: &Path,
        method: &str,
        path: &str,
        query: &str,
        headers: &[(String, String)],
        meta: &HashMap<String, String>,
    ) -> Result<Exchange> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        let mut sink = FramedWrite::new(write_half, NetstringCodec::default());
        let stream = FramedRead::new(read_half, NetstringCodec::default());

        let env = build_env(method, path, query, headers, meta);
        let env_bytes = Bytes::from(
            serde_json::to_vec(&env).expect("environment map always serializes"),
        );
        sink.send(env_bytes).await?;

        Ok(Exchange {
            writer: RequestWriter { sink, ended: false },
            body: ResponseBody {
                stream,
                done: false,
            },
        })
    }
}

/// Read the response head (status + headers) from an exchange, per spec
/// §4.1's inbound frames 1-2. After this resolves, `exchange.body` yields
/// the remaining body chunks.
pub async fn read_response_head(body: &mut ResponseBody) -> Result<ResponseHead> {
    let status_frame = body.next_frame().await?;
    let status: u16 = serde_json::from_slice(&status_frame.0)
        .map_err(|e| Error::new_protocol(format!("status frame: {}", e)))?;

    let headers_frame = body.next_frame().await?;
    let raw: HashMap<String, String> = serde_json::from_slice(&headers_frame.0)
        .map_err(|e| Error::new_protocol(format!("headers frame: {}", e)))?;
    let headers =
        fold_response_headers(&raw).map_err(|e| Error::new_protocol(format!("header value: {}", e)))?;

    Ok(ResponseHead { status, headers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstring::NetstringCodec as TestCodec;
    use futures_util::StreamExt as _;
    use tokio_util::codec::Framed;

    /// Drive the worker side of a raw socket pair: read the env frame,
    /// then write back a canned 200 "hello" response, matching spec §8
    /// scenario 3.
    async fn serve_hello(sock: UnixStream) {
        let mut framed = Framed::new(sock, TestCodec::default());
        let _env = framed.next().await.unwrap().unwrap();
        framed.send(Bytes::from(&b"200"[..])).await.unwrap();
        framed
            .send(Bytes::from(&b"{}"[..]))
            .await
            .unwrap();
        framed.send(Bytes::from(&b"hello"[..])).await.unwrap();
        framed.send(Bytes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn proxy_happy_path_roundtrip() {
        let dir = tempfile_dir();
        let sock_path = dir.join("worker.sock");
        let listener = tokio::net::UnixListener::bind(&sock_path).unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            serve_hello(sock).await;
        });

        let mut exchange = Client::request(
            &sock_path,
            "GET",
            "/",
            "",
            &[],
            &HashMap::new(),
        )
        .await
        .unwrap();
        exchange.writer.end(None).await.unwrap();

        let head = read_response_head(&mut exchange.body).await.unwrap();
        assert_eq!(head.status, 200);

        let mut collected = Vec::new();
        while let Some(chunk) = exchange.body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello");

        server.await.unwrap();
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("relay-pool-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
