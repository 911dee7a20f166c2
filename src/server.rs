// Copyright 2020 Joyent, Inc.

//! This module provides the server side of the protocol.
//!
//! A [`Server`] collects [`ServiceDescriptor`]s, then serves a listener:
//! every accepted connection gets its own task (see [`make_task`]) that
//! reads one request frame at a time, dispatches it, and writes the
//! response before reading the next frame. Failures reported by a method,
//! unknown services or methods, and requests whose header fields are
//! inconsistent are answered with an error response and the connection
//! stays open. Read or write errors, and length fields that make the
//! stream impossible to resynchronize, close the connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::codec::Framed;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::interceptor::{self, Interceptor, Outcome};
use crate::protocol::{CallRequest, CallResponse, FrameCodec, FrameLimits, Message, RawFrame};
use crate::service::{Registry, RequestContext, ServiceDescriptor};

pub struct Server {
    registry: Registry,
    config: ServerConfig,
    interceptors: Vec<Arc<dyn Interceptor>>,
    log: Logger,
}

impl Server {
    pub fn new(config: ServerConfig, log: Option<&Logger>) -> Server {
        Server {
            registry: Registry::new(),
            config,
            interceptors: Vec::new(),
            log: log
                .cloned()
                .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!())),
        }
    }

    /// Register `service` under its name. A service registered earlier
    /// under the same name is replaced.
    pub fn register(&mut self, service: ServiceDescriptor) -> &mut Server {
        let name = service.name().to_string();
        if self.registry.register(service).is_some() {
            warn!(self.log, "replaced registered service"; "service" => name);
        } else {
            debug!(self.log, "registered service"; "service" => name);
        }
        self
    }

    pub fn with_interceptor(mut self, hook: Arc<dyn Interceptor>) -> Server {
        self.interceptors.push(hook);
        self
    }

    /// Freeze the registered services into a dispatcher that connection
    /// tasks can share.
    pub fn into_dispatcher(self) -> (Arc<Dispatcher>, Logger) {
        let dispatcher = Dispatcher {
            registry: self.registry,
            limits: self.config.max_frame,
            interceptors: self.interceptors,
        };
        (Arc::new(dispatcher), self.log)
    }

    pub async fn bind<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections forever. Returns only if accepting fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, futures::future::pending()).await
    }

    /// Accept connections until `shutdown` completes. Connections already
    /// accepted keep being served by their own tasks.
    pub async fn serve_until<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (dispatcher, log) = self.into_dispatcher();
        if let Ok(addr) = listener.local_addr() {
            info!(log, "listening for rpc requests"; "address" => %addr);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(log, "no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            error!(log, "failed to accept socket"; "err" => %e);
                            return Err(e.into());
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(log, "failed to set TCP_NODELAY"; "err" => %e);
                    }
                    let dispatcher = Arc::clone(&dispatcher);
                    let process_log = log.clone();
                    tokio::spawn(async move {
                        make_task(stream, Some(peer), dispatcher, Some(&process_log)).await;
                    });
                }
            }
        }
    }
}

/// The read-only state every connection task shares.
pub struct Dispatcher {
    registry: Registry,
    limits: FrameLimits,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Dispatcher {
    pub fn limits(&self) -> &FrameLimits {
        &self.limits
    }

    /// Turn one inbound frame into the response to write back. Never
    /// fails: every problem is reported in the response's error payload.
    pub async fn handle(&self, frame: RawFrame, peer: Option<SocketAddr>, log: &Logger) -> CallResponse {
        let mut fallback = CallResponse::answering_frame(&frame);
        let req = match CallRequest::from_frame(frame) {
            Ok(req) => req,
            Err(e) => {
                warn!(log, "malformed request"; "request_id" => fallback.request_id, "err" => %e);
                fallback.set_error(format!("malformed request: {}", e));
                fallback.stamp_lengths();
                return fallback;
            }
        };

        debug!(log, "dispatching call";
            "service" => &req.service,
            "method" => &req.method,
            "request_id" => req.request_id);

        interceptor::run_before(&self.interceptors, &req);
        let start = Instant::now();

        let ctx = RequestContext {
            request_id: req.request_id,
            service: req.service.clone(),
            method: req.method.clone(),
            peer,
        };
        let mut resp = self.registry.dispatch(ctx, &req).await;
        if let Err(e) = self.limits.permits(&resp) {
            warn!(log, "response exceeds frame limits"; "request_id" => req.request_id, "err" => %e);
            resp.body = Bytes::new();
            resp.set_error(format!("response rejected: {}", e));
        }
        resp.stamp_lengths();

        interceptor::run_after(
            &self.interceptors,
            &req,
            &Outcome::Response(&resp),
            start.elapsed(),
        );
        resp
    }
}

/// Serve one connection until the peer closes it or an I/O error occurs.
pub async fn make_task<S>(
    socket: S,
    peer: Option<SocketAddr>,
    dispatcher: Arc<Dispatcher>,
    log: Option<&Logger>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let log = match peer {
        Some(addr) => log.new(o!("peer" => addr.to_string())),
        None => log,
    };
    debug!(log, "accepted connection");

    let codec = FrameCodec::<CallRequest>::new(dispatcher.limits);
    let mut framed = Framed::new(socket, codec);

    while let Some(next) = framed.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                error!(log, "failed to read request; closing connection"; "err" => %e);
                return;
            }
        };

        let resp = dispatcher.handle(frame, peer, &log).await;
        if let Err(e) = framed.send(resp).await {
            error!(log, "failed to write response; closing connection"; "err" => %e);
            return;
        }
    }

    debug!(log, "connection closed by peer");
}

#[cfg(test)]
mod tests {
    use super::*;

    use byteorder::{BigEndian, ByteOrder};
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::protocol::read_frame;

    fn dispatcher() -> Arc<Dispatcher> {
        let mut server = Server::new(ServerConfig::default(), None);
        server.register(ServiceDescriptor::new("echo").method(
            "Echo",
            |_ctx, s: String| async move { Ok::<_, String>(s) },
        ));
        server.into_dispatcher().0
    }

    fn encode<M: Message>(msg: &M) -> BytesMut {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf).unwrap();
        buf
    }

    async fn next_response<R: AsyncRead + Unpin>(r: &mut R) -> CallResponse {
        let frame = read_frame::<CallResponse, _>(r, &FrameLimits::default())
            .await
            .unwrap();
        CallResponse::from_frame(frame).unwrap()
    }

    #[tokio::test]
    async fn serves_sequential_frames_on_one_connection() {
        let (client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(make_task(server, None, dispatcher(), None));
        let (mut rd, mut wr) = tokio::io::split(client);

        // Written back to back before any response is read.
        let a = CallRequest::new(1, "echo", "Echo", Bytes::from_static(b"\"one\""));
        let b = CallRequest::new(2, "nope", "Echo", Bytes::from_static(b"\"two\""));
        let c = CallRequest::new(3, "echo", "Echo", Bytes::from_static(b"\"three\""));
        let mut wire = encode(&a);
        wire.extend_from_slice(&encode(&b));
        wire.extend_from_slice(&encode(&c));
        wr.write_all(&wire).await.unwrap();

        let ra = next_response(&mut rd).await;
        assert_eq!((ra.request_id, &ra.body[..]), (1, &b"\"one\""[..]));
        assert!(!ra.is_error());

        let rb = next_response(&mut rd).await;
        assert_eq!(rb.request_id, 2);
        assert_eq!(&rb.error[..], b"service not found: nope");
        assert!(rb.body.is_empty());

        let rc = next_response(&mut rd).await;
        assert_eq!((rc.request_id, &rc.body[..]), (3, &b"\"three\""[..]));

        drop(wr);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn inconsistent_header_is_answered_and_connection_kept() {
        let (client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(make_task(server, None, dispatcher(), None));
        let (mut rd, mut wr) = tokio::io::split(client);

        let bad = CallRequest::new(8, "echo", "Echo", Bytes::from_static(b"\"x\""));
        let mut wire = encode(&bad);
        BigEndian::write_u32(&mut wire[15..19], 1000);
        wr.write_all(&wire).await.unwrap();

        let resp = next_response(&mut rd).await;
        assert_eq!(resp.request_id, 8);
        assert!(String::from_utf8_lossy(&resp.error).starts_with("malformed request"));

        let good = CallRequest::new(9, "echo", "Echo", Bytes::from_static(b"\"ok\""));
        wr.write_all(&encode(&good)).await.unwrap();
        let resp = next_response(&mut rd).await;
        assert_eq!((resp.request_id, &resp.body[..]), (9, &b"\"ok\""[..]));

        drop(wr);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn bad_outer_length_closes_connection() {
        let (client, server) = tokio::io::duplex(64);
        let task = tokio::spawn(make_task(server, None, dispatcher(), None));
        let (mut rd, mut wr) = tokio::io::split(client);

        wr.write_all(&[0u8; 8]).await.unwrap();
        task.await.unwrap();

        let mut rest = Vec::new();
        assert_eq!(rd.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn serve_until_stops_accepting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(ServerConfig::default(), None);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_until(listener, async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
