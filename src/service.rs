// Copyright 2020 Joyent, Inc.

//! Server-side service descriptions and the registry calls are dispatched
//! through.
//!
//! A [`ServiceDescriptor`] is a name plus a table of methods. Each method
//! is registered as a typed async function taking one argument and
//! returning one result or an error; the descriptor wraps it at
//! registration time in a closure that decodes the argument, invokes the
//! function and encodes the result, so dispatch is a map lookup and a call.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{CallRequest, CallResponse};

/// What a method handler knows about the call it is serving.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: u32,
    pub service: String,
    pub method: String,
    pub peer: Option<SocketAddr>,
}

type MethodFuture = BoxFuture<'static, Result<Bytes, String>>;
type MethodHandler = Arc<dyn Fn(RequestContext, Bytes) -> MethodFuture + Send + Sync>;

pub struct ServiceDescriptor {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl ServiceDescriptor {
    pub fn new<S: Into<String>>(name: S) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method. Registering the same method name twice keeps the
    /// later handler.
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, f: F) -> ServiceDescriptor
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(RequestContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let handler = move |ctx: RequestContext, body: Bytes| -> MethodFuture {
            let arg: A = match serde_json::from_slice(&body) {
                Ok(arg) => arg,
                Err(e) => {
                    let msg = format!("failed to decode arguments for {}: {}", ctx.method, e);
                    return Box::pin(future::ready(Err(msg)));
                }
            };
            let call = f(ctx, arg);
            Box::pin(async move {
                match call.await {
                    Ok(res) => serde_json::to_vec(&res)
                        .map(Bytes::from)
                        .map_err(|e| format!("failed to encode result: {}", e)),
                    Err(e) => Err(e.to_string()),
                }
            })
        };
        self.methods.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.method_names().collect();
        methods.sort_unstable();
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("methods", &methods)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    services: HashMap<String, ServiceDescriptor>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Store `service` under its name, returning whatever was registered
    /// under that name before.
    pub fn register(&mut self, service: ServiceDescriptor) -> Option<ServiceDescriptor> {
        self.services.insert(service.name.clone(), service)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Locate and invoke the method `req` names. Every failure is carried
    /// in the returned response's error payload. The response's lengths
    /// are not stamped.
    pub async fn dispatch(&self, ctx: RequestContext, req: &CallRequest) -> CallResponse {
        let mut resp = CallResponse::answering(req);

        let service = match self.services.get(&req.service) {
            Some(service) => service,
            None => {
                resp.set_error(format!("service not found: {}", req.service));
                return resp;
            }
        };
        let handler = match service.methods.get(&req.method) {
            Some(handler) => handler,
            None => {
                resp.set_error(format!(
                    "method not found: {}.{}",
                    req.service, req.method
                ));
                return resp;
            }
        };

        // The handler is called inside the guard so that a panic while it
        // builds its future is caught as well as one while it is polled.
        let body = req.body.clone();
        let call = AssertUnwindSafe(future::lazy(|_| handler(ctx, body)).flatten()).catch_unwind();
        match call.await {
            Ok(Ok(body)) => resp.body = body,
            Ok(Err(msg)) if msg.is_empty() => {
                resp.set_error(format!("{}.{} failed", req.service, req.method))
            }
            Ok(Err(msg)) => resp.set_error(msg),
            Err(_) => resp.set_error(format!("{}.{} panicked", req.service, req.method)),
        }
        resp
    }
}
