// Copyright 2020 Joyent, Inc.

//! A bounded pool of reusable connections to a single address.
//!
//! `acquire` hands out a [`PooledConnection`] which owns its stream
//! exclusively until it is dropped. Dropping it returns the stream to the
//! idle set, unless it was marked broken, the idle set is full, or the pool
//! has been closed, in which case the stream is closed instead.
//!
//! Capacity is enforced with a semaphore: a permit is held for as long as a
//! connection is borrowed, and a new connection is only dialed while
//! holding a permit with nothing suitable idle, so the pool never opens
//! more than `max_cap` connections at once.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use slog::{debug, o, trace, warn, Drain, Logger};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// Something that can open a new connection to the pool's remote end.
pub trait Dial: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn dial(&self) -> BoxFuture<'_, io::Result<Self::Conn>>;

    /// Human readable description of the remote end, for logging.
    fn target(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct TcpDialer {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> TcpDialer {
        TcpDialer {
            addr,
            connect_timeout,
        }
    }
}

impl Dial for TcpDialer {
    type Conn = TcpStream;

    fn dial(&self) -> BoxFuture<'_, io::Result<TcpStream>> {
        Box::pin(async move {
            let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", self.addr),
                    )
                })??;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }

    fn target(&self) -> String {
        self.addr.to_string()
    }
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

pub struct ConnectionPool<D: Dial = TcpDialer> {
    dialer: D,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Idle<D::Conn>>>,
    dials: AtomicUsize,
    log: Logger,
}

impl<D: Dial> ConnectionPool<D> {
    /// Create an empty pool. No connections are dialed until `acquire`
    /// or `prefill` is called.
    pub fn new(dialer: D, config: PoolConfig, log: Option<&Logger>) -> Result<Arc<Self>> {
        config.validate()?;
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("target" => dialer.target()));

        Ok(Arc::new(ConnectionPool {
            permits: Arc::new(Semaphore::new(config.max_cap)),
            idle: Mutex::new(VecDeque::with_capacity(config.max_idle)),
            dials: AtomicUsize::new(0),
            dialer,
            config,
            log,
        }))
    }

    /// Create a pool and dial its initial connections. Fails if any of
    /// them cannot be established.
    pub async fn connect(dialer: D, config: PoolConfig, log: Option<&Logger>) -> Result<Arc<Self>> {
        let pool = ConnectionPool::new(dialer, config, log)?;
        pool.prefill().await?;
        Ok(pool)
    }

    /// Dial idle connections up to `initial_cap`. Stops early, without
    /// error, once the pool is at capacity.
    pub async fn prefill(&self) -> Result<()> {
        let wanted = self.config.initial_cap.min(self.config.max_idle);
        while self.idle_count() < wanted {
            // Held across the dial so borrowers cannot claim the same slot.
            let _permit = match self.permits.try_acquire() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if self.borrowed() + self.idle_count() > self.config.max_cap {
                break;
            }
            let conn = self.dial().await?;
            self.lock_idle().push_back(Idle {
                conn,
                since: Instant::now(),
            });
        }
        Ok(())
    }

    /// Connections currently lent out, counting permits held by `prefill`.
    fn borrowed(&self) -> usize {
        self.config
            .max_cap
            .saturating_sub(self.permits.available_permits())
    }

    /// Borrow a connection, reusing an idle one when possible.
    ///
    /// Waits up to the configured acquire timeout for capacity and fails
    /// with `PoolExhausted` if none frees up.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<D>> {
        let permit = match timeout(
            self.config.acquire_timeout(),
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                warn!(self.log, "timed out waiting for a pooled connection";
                    "max_cap" => self.config.max_cap);
                return Err(Error::PoolExhausted);
            }
        };

        let conn = match self.take_idle() {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            broken: false,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Stop handing out connections and close every idle one. Borrowed
    /// connections are closed when they are released.
    pub fn close(&self) {
        self.permits.close();
        self.lock_idle().clear();
        debug!(self.log, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    /// Total number of connections this pool has dialed.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn dial(&self) -> Result<D::Conn> {
        let conn = self.dialer.dial().await.map_err(|e| {
            warn!(self.log, "failed to dial connection"; "err" => %e);
            Error::Io(e)
        })?;
        let n = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(self.log, "dialed new connection"; "dials" => n);
        Ok(conn)
    }

    fn take_idle(&self) -> Option<D::Conn> {
        let idle_timeout = self.config.idle_timeout();
        let mut idle = self.lock_idle();
        let before = idle.len();
        idle.retain(|c| c.since.elapsed() < idle_timeout);
        if idle.len() < before {
            trace!(self.log, "evicted idle connections"; "count" => before - idle.len());
        }
        idle.pop_back().map(|c| c.conn)
    }

    fn put_back(&self, conn: D::Conn, broken: bool) {
        if broken {
            debug!(self.log, "discarding broken connection");
            return;
        }
        if self.is_closed() {
            return;
        }
        let mut idle = self.lock_idle();
        if idle.len() < self.config.max_idle {
            idle.push_back(Idle {
                conn,
                since: Instant::now(),
            });
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<Idle<D::Conn>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<D: Dial> fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.dialer.target())
            .field("idle", &self.idle_count())
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

/// A connection borrowed from a [`ConnectionPool`].
pub struct PooledConnection<D: Dial = TcpDialer> {
    conn: Option<D::Conn>,
    broken: bool,
    pool: Arc<ConnectionPool<D>>,
    // Dropped after `Drop::drop` has returned the connection, so a waiter
    // woken by the permit finds it idle instead of dialing another.
    _permit: OwnedSemaphorePermit,
}

impl<D: Dial> PooledConnection<D> {
    pub fn stream(&mut self) -> Result<&mut D::Conn> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Close the connection on release instead of returning it idle.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Undo `mark_broken` once the connection is known to sit on a frame
    /// boundary again.
    pub fn mark_healthy(&mut self) {
        self.broken = false;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<D: Dial> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use tokio::net::TcpListener;

    #[derive(Debug)]
    struct TestConn {
        id: usize,
    }

    #[derive(Default)]
    struct CountingDialer {
        next: AtomicUsize,
        fail: bool,
    }

    impl Dial for CountingDialer {
        type Conn = TestConn;

        fn dial(&self) -> BoxFuture<'_, io::Result<TestConn>> {
            Box::pin(async move {
                if self.fail {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
                }
                Ok(TestConn {
                    id: self.next.fetch_add(1, Ordering::SeqCst),
                })
            })
        }

        fn target(&self) -> String {
            String::from("test")
        }
    }

    fn config(max_cap: usize, max_idle: usize) -> PoolConfig {
        PoolConfig {
            initial_cap: 0,
            max_cap,
            max_idle,
            acquire_timeout_ms: 200,
            ..PoolConfig::default()
        }
    }

    fn pool(max_cap: usize, max_idle: usize) -> Arc<ConnectionPool<CountingDialer>> {
        ConnectionPool::new(CountingDialer::default(), config(max_cap, max_idle), None).unwrap()
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let pool = pool(2, 2);
        let first = {
            let mut conn = pool.acquire().await.unwrap();
            conn.stream().unwrap().id
        };
        assert_eq!(pool.idle_count(), 1);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(conn.stream().unwrap().id, first);
        assert_eq!(pool.dial_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_borrowers_never_share_and_dials_stay_bounded() {
        let cap = 3;
        let pool = pool(cap, cap);
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            tasks.push(tokio::spawn(async move {
                let mut conn = pool.acquire().await.unwrap();
                let id = conn.stream().unwrap().id;
                assert!(in_use.lock().unwrap().insert(id), "connection {} shared", id);
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert!(in_use.lock().unwrap().remove(&id));
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert!(pool.dial_count() <= cap, "dialed {}", pool.dial_count());
        assert_eq!(pool.idle_count(), pool.dial_count());
    }

    #[tokio::test]
    async fn broken_connection_is_not_returned() {
        let pool = pool(1, 1);
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.mark_broken();
            assert!(conn.is_broken());
        }
        assert_eq!(pool.idle_count(), 0);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(conn.stream().unwrap().id, 1);
        assert_eq!(pool.dial_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = pool(1, 1);
        let _held = pool.acquire().await.unwrap();
        match pool.acquire().await {
            Err(Error::PoolExhausted) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn waiter_gets_released_connection() {
        let pool = pool(1, 1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|mut c| c.stream().unwrap().id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
        assert_eq!(pool.dial_count(), 1);
    }

    #[tokio::test]
    async fn idle_connections_expire() {
        let cfg = PoolConfig {
            idle_timeout_ms: 10,
            ..config(2, 2)
        };
        let pool = ConnectionPool::new(CountingDialer::default(), cfg, None).unwrap();
        drop(pool.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(conn.stream().unwrap().id, 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn idle_set_is_capped() {
        let pool = pool(3, 1);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn failed_dial_releases_capacity() {
        let dialer = CountingDialer {
            fail: true,
            ..CountingDialer::default()
        };
        let pool = ConnectionPool::new(dialer, config(1, 1), None).unwrap();
        for _ in 0..2 {
            match pool.acquire().await {
                Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
                other => panic!("unexpected result: {:?}", other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn closed_pool_refuses_and_drops_returns() {
        let pool = pool(2, 2);
        let conn = pool.acquire().await.unwrap();
        pool.close();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn prefill_dials_initial_connections() {
        let cfg = PoolConfig {
            initial_cap: 2,
            ..config(4, 4)
        };
        let pool = ConnectionPool::connect(CountingDialer::default(), cfg, None)
            .await
            .unwrap();
        assert_eq!(pool.dial_count(), 2);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn prefill_respects_capacity_while_borrowed() {
        let cfg = PoolConfig {
            initial_cap: 1,
            ..config(1, 1)
        };
        let pool = ConnectionPool::new(CountingDialer::default(), cfg, None).unwrap();
        let held = pool.acquire().await.unwrap();
        pool.prefill().await.unwrap();
        assert_eq!(pool.dial_count(), 1);
        assert_eq!(pool.idle_count(), 0);
        drop(held);
        assert_eq!(pool.idle_count(), 1);

        let cfg = PoolConfig {
            initial_cap: 2,
            ..config(2, 2)
        };
        let pool = ConnectionPool::new(CountingDialer::default(), cfg, None).unwrap();
        let _held = pool.acquire().await.unwrap();
        pool.prefill().await.unwrap();
        // one borrowed plus one idle fills a pool of two
        assert_eq!(pool.dial_count(), 2);
        assert_eq!(pool.idle_count(), 1);
        pool.prefill().await.unwrap();
        assert_eq!(pool.dial_count(), 2);
    }

    #[tokio::test]
    async fn tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = TcpDialer::new(addr, Duration::from_secs(1));
        let stream = dialer.dial().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert_eq!(dialer.target(), addr.to_string());
    }
}
