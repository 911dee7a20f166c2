// Copyright 2020 Joyent, Inc.

use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, error, o, Drain, Logger};

use micro_rpc::config::ServerConfig;
use micro_rpc::interceptor::LogInterceptor;
use micro_rpc::{RequestContext, Server, ServiceDescriptor};

#[derive(Serialize, Deserialize)]
struct YesPayload {
    value: Value,
    count: u32,
}

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct BenchPayload {
    echo: Vec<Value>,
    delay: Option<u64>,
}

fn demo_service(log: &Logger) -> ServiceDescriptor {
    let date_log = log.clone();
    let yes_log = log.clone();

    ServiceDescriptor::new("demo")
        .method("date", move |_ctx: RequestContext, _args: Value| {
            debug!(date_log, "handling date request");
            let date = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|now| DatePayload {
                    timestamp: now.as_millis() as u64,
                })
                .map_err(|e| e.to_string());
            async move { date }
        })
        .method("echo", |_ctx, args: Value| async move {
            Ok::<_, String>(args)
        })
        .method("yes", move |ctx: RequestContext, payload: YesPayload| {
            debug!(yes_log, "handling yes request"; "request_id" => ctx.request_id);
            async move {
                if payload.count > 10_000 {
                    return Err(format!("count {} is too large", payload.count));
                }
                Ok(vec![payload.value; payload.count as usize])
            }
        })
        .method("bench", |_ctx, payload: BenchPayload| async move {
            if let Some(ms) = payload.delay {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let resp: Vec<Value> = payload
                .echo
                .into_iter()
                .map(|v| json!({ "value": v }))
                .collect();
            Ok::<_, String>(resp)
        })
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2030".to_string());
    let addr = addr.parse::<SocketAddr>().unwrap_or_else(|e| {
        eprintln!("Failed to parse listen address: {}", e);
        process::exit(1)
    });

    let mut server = Server::new(ServerConfig::default(), Some(&root_log))
        .with_interceptor(Arc::new(LogInterceptor::new(&root_log, "server")));
    server.register(demo_service(&root_log));

    if let Err(e) = server.bind(addr).await {
        error!(root_log, "server stopped"; "err" => %e);
        process::exit(1);
    }
}
