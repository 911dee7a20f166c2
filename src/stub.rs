// Copyright 2020 Joyent, Inc.

//! Client stubs: typed handles whose calls are carried out remotely.
//!
//! A [`Stub`] binds a service name to an [`Invoker`] and mints one
//! [`RemoteMethod`] per method. The [`rpc_client!`](crate::rpc_client)
//! macro declares a record of such handles and generates the binding code,
//! so a service client is written as a list of method signatures:
//!
//! ```ignore
//! rpc_client! {
//!     pub struct UserClient("user-service") {
//!         get_by_id: "GetById"(GetByIdReq) -> GetByIdResp,
//!     }
//! }
//!
//! let users = UserClient::bind(invoker)?;
//! let resp = users.get_by_id.call(&CallContext::new(), &GetByIdReq { id: 123 }).await?;
//! ```
//!
//! Invalid bindings (an empty service or method name, or a method bound
//! twice) fail in `bind`, before any call is made.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;

use crate::client::Invoker;
use crate::error::{Error, Result};

/// Per-call options on the calling side.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> CallContext {
        CallContext::default()
    }

    /// Give up waiting locally after `timeout`. The server is not told and
    /// may still execute the call.
    pub fn with_timeout(timeout: Duration) -> CallContext {
        CallContext {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Implemented by the records `rpc_client!` declares.
pub trait ServiceStub: Sized {
    fn service_name() -> &'static str;

    fn bind(invoker: Arc<dyn Invoker>) -> Result<Self>;
}

pub struct Stub {
    invoker: Arc<dyn Invoker>,
    service: Arc<str>,
    bound: HashSet<String>,
}

impl Stub {
    pub fn bind<S: Into<String>>(service: S, invoker: Arc<dyn Invoker>) -> Result<Stub> {
        let service = service.into();
        if service.is_empty() {
            return Err(Error::InvalidStub(String::from("service name is empty")));
        }
        Ok(Stub {
            invoker,
            service: Arc::from(service),
            bound: HashSet::new(),
        })
    }

    pub fn method<A, R>(&mut self, name: &str) -> Result<RemoteMethod<A, R>>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if name.is_empty() {
            return Err(Error::InvalidStub(format!(
                "empty method name on service {}",
                self.service
            )));
        }
        if !self.bound.insert(name.to_string()) {
            return Err(Error::InvalidStub(format!(
                "method {} bound twice on service {}",
                name, self.service
            )));
        }
        Ok(RemoteMethod {
            invoker: Arc::clone(&self.invoker),
            service: Arc::clone(&self.service),
            method: Arc::from(name),
            _types: PhantomData,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

/// A method of a remote service taking `A` and returning `R`.
pub struct RemoteMethod<A, R> {
    invoker: Arc<dyn Invoker>,
    service: Arc<str>,
    method: Arc<str>,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> RemoteMethod<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    /// Serialize `arg`, invoke the method remotely and decode its result.
    ///
    /// A failure reported by the remote method comes back as
    /// `Error::Remote`; see `RemoteError::partial_result` for the
    /// best-effort value that accompanies it.
    pub async fn call(&self, ctx: &CallContext, arg: &A) -> Result<R> {
        let args = Bytes::from(serde_json::to_vec(arg)?);
        let invoke = self.invoker.invoke(&self.service, &self.method, args);
        let body = match ctx.timeout() {
            Some(t) => timeout(t, invoke)
                .await
                .map_err(|_| Error::Timeout("waiting for remote call"))??,
            None => invoke.await?,
        };

        if body.is_empty() {
            Ok(serde_json::from_value(Value::Null)?)
        } else {
            Ok(serde_json::from_slice(&body)?)
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl<A, R> Clone for RemoteMethod<A, R> {
    fn clone(&self) -> RemoteMethod<A, R> {
        RemoteMethod {
            invoker: Arc::clone(&self.invoker),
            service: Arc::clone(&self.service),
            method: Arc::clone(&self.method),
            _types: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for RemoteMethod<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteMethod({}.{})", self.service, self.method)
    }
}

/// Declare a client stub record. Each field is a [`RemoteMethod`] bound to
/// the quoted remote method name.
#[macro_export]
macro_rules! rpc_client {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident ($service:expr) {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $method:literal ($arg:ty) -> $ret:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $crate::stub::RemoteMethod<$arg, $ret>,
            )*
        }

        impl $crate::stub::ServiceStub for $name {
            fn service_name() -> &'static str {
                $service
            }

            fn bind(
                invoker: ::std::sync::Arc<dyn $crate::client::Invoker>,
            ) -> $crate::error::Result<Self> {
                #[allow(unused_mut)]
                let mut stub = $crate::stub::Stub::bind(
                    <Self as $crate::stub::ServiceStub>::service_name(),
                    invoker,
                )?;
                Ok($name {
                    $( $field: stub.method($method)?, )*
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use serde_derive::{Deserialize, Serialize};

    use crate::error::RemoteError;

    #[derive(Debug, Deserialize, Serialize)]
    struct GetByIdReq {
        id: u64,
    }

    #[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
    struct GetByIdResp {
        name: String,
    }

    /// Answers from a fixed script and records what it was asked.
    #[derive(Default)]
    struct ScriptedInvoker {
        calls: Mutex<Vec<(String, String, Vec<u8>)>>,
        reply: Mutex<Option<Result<Bytes>>>,
        delay: Option<Duration>,
    }

    impl ScriptedInvoker {
        fn replying(reply: Result<Bytes>) -> ScriptedInvoker {
            ScriptedInvoker {
                reply: Mutex::new(Some(reply)),
                ..ScriptedInvoker::default()
            }
        }
    }

    impl Invoker for ScriptedInvoker {
        fn invoke<'a>(
            &'a self,
            service: &'a str,
            method: &'a str,
            args: Bytes,
        ) -> BoxFuture<'a, Result<Bytes>> {
            self.calls
                .lock()
                .unwrap()
                .push((service.to_string(), method.to_string(), args.to_vec()));
            Box::pin(async move {
                if let Some(d) = self.delay {
                    tokio::time::sleep(d).await;
                }
                self.reply
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| Ok(Bytes::new()))
            })
        }
    }

    rpc_client! {
        /// Test stub.
        struct UserClient("user-service") {
            get_by_id: "GetById"(GetByIdReq) -> GetByIdResp,
            ping: "Ping"(()) -> Option<String>,
        }
    }

    rpc_client! {
        struct Nameless("") {
            ping: "Ping"(()) -> (),
        }
    }

    rpc_client! {
        struct Twice("svc") {
            a: "Same"(()) -> (),
            b: "Same"(()) -> (),
        }
    }

    #[tokio::test]
    async fn stub_call_names_service_and_method() {
        let invoker = Arc::new(ScriptedInvoker::replying(Ok(Bytes::from_static(
            b"{\"name\":\"hello, world 0\"}",
        ))));
        let users = UserClient::bind(invoker.clone()).unwrap();
        assert_eq!(UserClient::service_name(), "user-service");

        let resp = users
            .get_by_id
            .call(&CallContext::new(), &GetByIdReq { id: 123 })
            .await
            .unwrap();
        assert_eq!(resp.name, "hello, world 0");

        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "user-service");
        assert_eq!(calls[0].1, "GetById");
        assert_eq!(calls[0].2, b"{\"id\":123}".to_vec());
    }

    #[tokio::test]
    async fn empty_result_decodes_as_null() {
        let users = UserClient::bind(Arc::new(ScriptedInvoker::default())).unwrap();
        assert_eq!(users.ping.call(&CallContext::new(), &()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remote_error_passes_through() {
        let reply = Err(Error::Remote(RemoteError::new("user not found", Bytes::new())));
        let users = UserClient::bind(Arc::new(ScriptedInvoker::replying(reply))).unwrap();
        let err = users
            .get_by_id
            .call(&CallContext::new(), &GetByIdReq { id: 1 })
            .await
            .unwrap_err();
        let remote = err.remote().expect("remote error");
        assert_eq!(remote.message, "user not found");
        assert_eq!(remote.partial_result::<GetByIdResp>(), GetByIdResp::default());
    }

    #[tokio::test]
    async fn local_timeout_aborts_waiting() {
        let invoker = ScriptedInvoker {
            delay: Some(Duration::from_millis(200)),
            ..ScriptedInvoker::default()
        };
        let users = UserClient::bind(Arc::new(invoker)).unwrap();
        let err = users
            .ping
            .call(&CallContext::with_timeout(Duration::from_millis(10)), &())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn malformed_stubs_fail_at_bind() {
        let invoker: Arc<dyn Invoker> = Arc::new(ScriptedInvoker::default());
        assert!(matches!(
            Nameless::bind(Arc::clone(&invoker)),
            Err(Error::InvalidStub(_))
        ));
        assert!(matches!(
            Twice::bind(Arc::clone(&invoker)),
            Err(Error::InvalidStub(_))
        ));

        let mut stub = Stub::bind("svc", invoker).unwrap();
        assert!(matches!(
            stub.method::<(), ()>(""),
            Err(Error::InvalidStub(_))
        ));
        let m = stub.method::<(), ()>("Get").unwrap();
        assert_eq!((m.service(), m.method()), ("svc", "Get"));
        assert_eq!(format!("{:?}", m.clone()), "RemoteMethod(svc.Get)");
    }
}
