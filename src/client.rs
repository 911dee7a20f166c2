// Copyright 2020 Joyent, Inc.

//! Client side of the protocol: one request, one response, one pooled
//! connection per call.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use slog::{debug, o, warn, Drain, Logger};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::{Error, RemoteError, Result};
use crate::interceptor::{self, Interceptor, Outcome};
use crate::pool::{ConnectionPool, PooledConnection, TcpDialer};
use crate::protocol::{read_frame, CallRequest, CallResponse, FrameLimits, Message, RequestIdGen};

/// The capability stubs are built on: call `method` of `service` with
/// serialized arguments and get the serialized result back.
///
/// A response carrying an error payload is returned as `Error::Remote`.
pub trait Invoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        service: &'a str,
        method: &'a str,
        args: Bytes,
    ) -> BoxFuture<'a, Result<Bytes>>;
}

/// Maps a service name to the addresses currently serving it.
pub trait Resolver: Send + Sync {
    fn resolve<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<Vec<SocketAddr>>>;
}

/// Chooses one address out of those a `Resolver` returned.
pub trait Picker: Send + Sync {
    fn pick(&self, service: &str, addrs: &[SocketAddr]) -> Option<SocketAddr>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    services: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> StaticResolver {
        StaticResolver::default()
    }

    pub fn add<S: Into<String>>(mut self, service: S, addr: SocketAddr) -> StaticResolver {
        self.services.entry(service.into()).or_default().push(addr);
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<Vec<SocketAddr>>> {
        let addrs = self.services.get(service).cloned().unwrap_or_default();
        Box::pin(futures::future::ready(Ok(addrs)))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RandomPicker;

impl Picker for RandomPicker {
    fn pick(&self, _service: &str, addrs: &[SocketAddr]) -> Option<SocketAddr> {
        addrs.choose(&mut rand::thread_rng()).copied()
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinPicker {
    next: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _service: &str, addrs: &[SocketAddr]) -> Option<SocketAddr> {
        if addrs.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % addrs.len();
        Some(addrs[i])
    }
}

enum Target {
    Fixed(Arc<ConnectionPool>),
    Discovered {
        resolver: Arc<dyn Resolver>,
        picker: Arc<dyn Picker>,
        pools: Mutex<HashMap<SocketAddr, Arc<ConnectionPool>>>,
    },
}

/// Pool counters summed over every address a client has talked to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub dials: usize,
    pub idle: usize,
}

pub struct Client {
    target: Target,
    ids: RequestIdGen,
    config: ClientConfig,
    interceptors: Vec<Arc<dyn Interceptor>>,
    closed: AtomicBool,
    log: Logger,
}

impl Client {
    /// A client for a single server address. The pool's initial
    /// connections are dialed before this returns.
    pub async fn connect(addr: SocketAddr, config: ClientConfig, log: Option<&Logger>) -> Result<Client> {
        let log = client_logger(log);
        let dialer = TcpDialer::new(addr, config.pool.connect_timeout());
        let pool = ConnectionPool::connect(dialer, config.pool.clone(), Some(&log)).await?;
        Ok(Client::build(Target::Fixed(pool), config, log))
    }

    /// A client that resolves the service name on every call and reaches
    /// exactly one of the returned addresses.
    pub fn with_discovery(
        resolver: Arc<dyn Resolver>,
        picker: Arc<dyn Picker>,
        config: ClientConfig,
        log: Option<&Logger>,
    ) -> Result<Client> {
        config.pool.validate()?;
        let target = Target::Discovered {
            resolver,
            picker,
            pools: Mutex::new(HashMap::new()),
        };
        Ok(Client::build(target, config, client_logger(log)))
    }

    fn build(target: Target, config: ClientConfig, log: Logger) -> Client {
        Client {
            target,
            ids: RequestIdGen::new(),
            config,
            interceptors: Vec::new(),
            closed: AtomicBool::new(false),
            log,
        }
    }

    pub fn with_interceptor(mut self, hook: Arc<dyn Interceptor>) -> Client {
        self.interceptors.push(hook);
        self
    }

    /// Perform one round trip with `req` as given. Error payloads in the
    /// response are returned as part of the response, not as `Err`.
    pub async fn call(&self, req: CallRequest) -> Result<CallResponse> {
        interceptor::run_before(&self.interceptors, &req);
        let start = Instant::now();

        let res = match self.pool_for(&req.service).await {
            Ok(pool) => self.round_trip(&pool, &req).await,
            Err(e) => Err(e),
        };

        let outcome = match &res {
            Ok(resp) => Outcome::Response(resp),
            Err(e) => Outcome::Failed(e),
        };
        interceptor::run_after(&self.interceptors, &req, &outcome, start.elapsed());
        res
    }

    pub fn new_request(&self, service: &str, method: &str, args: Bytes) -> CallRequest {
        CallRequest::new(self.ids.next_id(), service, method, args)
    }

    pub fn pool_stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        let mut add = |pool: &ConnectionPool| {
            stats.dials += pool.dial_count();
            stats.idle += pool.idle_count();
        };
        match &self.target {
            Target::Fixed(pool) => add(pool.as_ref()),
            Target::Discovered { pools, .. } => {
                for pool in lock(pools).values() {
                    add(pool.as_ref());
                }
            }
        }
        stats
    }

    /// Close every pool. Later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        match &self.target {
            Target::Fixed(pool) => pool.close(),
            Target::Discovered { pools, .. } => {
                for (_, pool) in lock(pools).drain() {
                    pool.close();
                }
            }
        }
    }

    async fn pool_for(&self, service: &str) -> Result<Arc<ConnectionPool>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        let (resolver, picker, pools) = match &self.target {
            Target::Fixed(pool) => return Ok(Arc::clone(pool)),
            Target::Discovered {
                resolver,
                picker,
                pools,
            } => (resolver, picker, pools),
        };

        let addrs = resolver.resolve(service).await?;
        let addr = picker
            .pick(service, &addrs)
            .ok_or_else(|| Error::NoAddress(service.to_string()))?;

        let mut pools = lock(pools);
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        if let Some(pool) = pools.get(&addr) {
            return Ok(Arc::clone(pool));
        }
        let dialer = TcpDialer::new(addr, self.config.pool.connect_timeout());
        let pool = ConnectionPool::new(dialer, self.config.pool.clone(), Some(&self.log))?;
        pools.insert(addr, Arc::clone(&pool));
        Ok(pool)
    }

    async fn round_trip(&self, pool: &Arc<ConnectionPool>, req: &CallRequest) -> Result<CallResponse> {
        let limits = self.config.max_frame;
        limits.permits(req)?;
        let mut frame = BytesMut::new();
        req.encode(&mut frame)?;

        let mut conn = pool.acquire().await?;
        let log = self.log.new(o!("request_id" => req.request_id));
        debug!(log, "sending request";
            "service" => &req.service, "method" => &req.method);

        /*
         * Until a complete response has been read the connection may hold
         * part of a frame, so it stays marked broken. If this future is
         * dropped midway the connection is closed on release.
         */
        conn.mark_broken();
        let fut = exchange(&mut conn, &frame, &limits, req.request_id);
        let res = match self.config.call_timeout() {
            Some(t) => timeout(t, fut)
                .await
                .unwrap_or(Err(Error::Timeout("waiting for response"))),
            None => fut.await,
        };

        match &res {
            Ok(_) => conn.mark_healthy(),
            Err(e) => {
                warn!(log, "call failed, discarding connection"; "err" => %e);
            }
        }
        res
    }
}

impl Invoker for Client {
    fn invoke<'a>(
        &'a self,
        service: &'a str,
        method: &'a str,
        args: Bytes,
    ) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let resp = self.call(self.new_request(service, method, args)).await?;
            if resp.is_error() {
                let message = String::from_utf8_lossy(&resp.error).into_owned();
                return Err(Error::Remote(RemoteError::new(message, resp.body)));
            }
            Ok(resp.body)
        })
    }
}

async fn exchange(
    conn: &mut PooledConnection,
    frame: &[u8],
    limits: &FrameLimits,
    request_id: u32,
) -> Result<CallResponse> {
    let stream = conn.stream()?;
    stream.write_all(frame).await?;
    stream.flush().await?;

    let raw = read_frame::<CallResponse, _>(stream, limits)
        .await
        .map_err(|e| match e {
            Error::Io(ref ioe) if ioe.kind() == io::ErrorKind::UnexpectedEof => {
                Error::ConnectionClosed
            }
            e => e,
        })?;
    let resp = CallResponse::from_frame(raw)?;
    if resp.request_id != request_id {
        return Err(Error::ResponseMismatch {
            expected: request_id,
            actual: resp.request_id,
        });
    }
    Ok(resp)
}

fn client_logger(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
        .new(o!("component" => "client"))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
