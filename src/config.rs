// Copyright 2020 Joyent, Inc.

//! Tunables for the client, its connection pools and the server.
//!
//! Every struct deserializes from JSON with missing fields falling back to
//! their defaults, so `{}` is a valid configuration.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_derive::Deserialize;

use crate::error::{Error, Result};
pub use crate::protocol::FrameLimits;

pub fn from_json_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections dialed when the pool is created.
    pub initial_cap: usize,
    /// Upper bound on open connections, idle or borrowed.
    pub max_cap: usize,
    /// Upper bound on idle connections kept for reuse.
    pub max_idle: usize,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            initial_cap: 1,
            max_cap: 30,
            max_idle: 10,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 3_000,
            acquire_timeout_ms: 3_000,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cap == 0 {
            return Err(Error::Config(String::from("max_cap must be at least 1")));
        }
        if self.initial_cap > self.max_cap {
            return Err(Error::Config(format!(
                "initial_cap {} exceeds max_cap {}",
                self.initial_cap, self.max_cap
            )));
        }
        if self.max_idle > self.max_cap {
            return Err(Error::Config(format!(
                "max_idle {} exceeds max_cap {}",
                self.max_idle, self.max_cap
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    /// Bound on the local wait for a response once the request is written.
    /// The server is not told about it.
    pub call_timeout_ms: Option<u64>,
    pub max_frame: FrameLimits,
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_frame: FrameLimits,
}
