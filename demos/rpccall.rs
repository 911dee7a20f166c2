// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;

use micro_rpc::config::{ClientConfig, PoolConfig};
use micro_rpc::{CallContext, Client, Error, RemoteMethod, Stub};

static APP: &str = "rpccall";
static DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a single RPC method call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("service")
                .help("Name of the remote service")
                .long("service")
                .short("s")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded argument for RPC method call")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Milliseconds to wait for the response")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let service = matches.value_of("service").unwrap_or_default().to_string();
    let method = matches.value_of("method").unwrap_or_default().to_string();
    let args = value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit());
    let ctx = match value_t!(matches, "timeout", u64) {
        Ok(ms) => CallContext::with_timeout(Duration::from_millis(ms)),
        Err(_) => CallContext::new(),
    };

    let config = ClientConfig {
        pool: PoolConfig {
            initial_cap: 1,
            max_cap: 1,
            ..PoolConfig::default()
        },
        ..ClientConfig::default()
    };
    let client = Client::connect(addr, config, None)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to connect to server: {}", e);
            process::exit(1)
        });

    let remote: RemoteMethod<Value, Value> = Stub::bind(service, Arc::new(client))
        .and_then(|mut stub| stub.method(&method))
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            process::exit(1)
        });

    match remote.call(&ctx, &args).await {
        Ok(result) => println!("{}", result),
        Err(Error::Remote(e)) => {
            eprintln!("Remote error: {}", e);
            if !e.body.is_empty() {
                println!("{}", String::from_utf8_lossy(&e.body));
            }
            process::exit(2)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }
}
