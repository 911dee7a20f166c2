// Copyright 2020 Joyent, Inc.

//! Hooks run around every call on the client and on the server.
//!
//! Interceptors only observe. Anything that needs to replace a call on the
//! client side can wrap an [`Invoker`](crate::client::Invoker) instead.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, o, warn, Logger};

use crate::error::Error;
use crate::protocol::{CallRequest, CallResponse};

/// How a call ended, as seen by the side running the hook.
#[derive(Debug)]
pub enum Outcome<'a> {
    /// A response was produced. It may still carry an error payload.
    Response(&'a CallResponse),
    /// No response was produced at all.
    Failed(&'a Error),
}

impl<'a> Outcome<'a> {
    pub fn is_error(&self) -> bool {
        match self {
            Outcome::Response(resp) => resp.is_error(),
            Outcome::Failed(_) => true,
        }
    }
}

pub trait Interceptor: Send + Sync {
    fn before(&self, _req: &CallRequest) {}

    fn after(&self, _req: &CallRequest, _outcome: &Outcome<'_>, _elapsed: Duration) {}
}

pub(crate) fn run_before(hooks: &[Arc<dyn Interceptor>], req: &CallRequest) {
    for hook in hooks {
        hook.before(req);
    }
}

pub(crate) fn run_after(
    hooks: &[Arc<dyn Interceptor>],
    req: &CallRequest,
    outcome: &Outcome<'_>,
    elapsed: Duration,
) {
    for hook in hooks.iter().rev() {
        hook.after(req, outcome, elapsed);
    }
}

/// Logs one line per completed call.
pub struct LogInterceptor {
    log: Logger,
}

impl LogInterceptor {
    pub fn new(log: &Logger, side: &'static str) -> LogInterceptor {
        LogInterceptor {
            log: log.new(o!("side" => side)),
        }
    }
}

impl Interceptor for LogInterceptor {
    fn after(&self, req: &CallRequest, outcome: &Outcome<'_>, elapsed: Duration) {
        let elapsed_us = elapsed.as_micros() as u64;
        match outcome {
            Outcome::Response(resp) if resp.is_error() => {
                let err = String::from_utf8_lossy(&resp.error);
                warn!(self.log, "call returned error";
                    "service" => &req.service,
                    "method" => &req.method,
                    "request_id" => req.request_id,
                    "elapsed_us" => elapsed_us,
                    "err" => %err);
            }
            Outcome::Response(resp) => {
                debug!(self.log, "call complete";
                    "service" => &req.service,
                    "method" => &req.method,
                    "request_id" => req.request_id,
                    "elapsed_us" => elapsed_us,
                    "body_len" => resp.body_len);
            }
            Outcome::Failed(e) => {
                warn!(self.log, "call failed";
                    "service" => &req.service,
                    "method" => &req.method,
                    "request_id" => req.request_id,
                    "elapsed_us" => elapsed_us,
                    "err" => %e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use bytes::Bytes;

    struct Recorder {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Interceptor for Recorder {
        fn before(&self, req: &CallRequest) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{} before {}", self.name, req.method));
        }

        fn after(&self, req: &CallRequest, outcome: &Outcome<'_>, _elapsed: Duration) {
            self.events.lock().unwrap().push(format!(
                "{} after {} error={}",
                self.name,
                req.method,
                outcome.is_error()
            ));
        }
    }

    #[test]
    fn hooks_nest_around_the_call() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recorder {
                name: "outer",
                events: Arc::clone(&events),
            }),
            Arc::new(Recorder {
                name: "inner",
                events: Arc::clone(&events),
            }),
        ];

        let req = CallRequest::new(1, "svc", "Get", Bytes::new());
        let mut resp = CallResponse::answering(&req);
        resp.set_error("nope");
        resp.stamp_lengths();

        run_before(&hooks, &req);
        run_after(&hooks, &req, &Outcome::Response(&resp), Duration::from_millis(1));

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "outer before Get",
                "inner before Get",
                "inner after Get error=true",
                "outer after Get error=true",
            ]
        );
    }

    #[test]
    fn failed_outcome_is_error() {
        let err = Error::ConnectionClosed;
        assert!(Outcome::Failed(&err).is_error());

        let req = CallRequest::new(1, "svc", "Get", Bytes::new());
        let resp = CallResponse::answering(&req);
        assert!(!Outcome::Response(&resp).is_error());
    }
}
