//! Process-wide HTTP client cache. One pooled client per (kind, proxy)
//! pair; connection reuse matters far more than construction cost.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::{ExecutorError, ExecutorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Global,
    Claude,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    kind: ClientKind,
    proxy: Option<String>,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<ClientKey, wreq::Client>>> = OnceLock::new();

pub fn shared_client(kind: ClientKind, proxy: Option<&str>) -> ExecutorResult<wreq::Client> {
    let key = ClientKey {
        kind,
        proxy: normalize_proxy(proxy),
    };

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| ExecutorError::Other("http client cache lock failed".to_string()))?;

    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let client = build_client(key.proxy.as_deref())?;
    guard.insert(key, client.clone());
    Ok(client)
}

fn build_client(proxy: Option<&str>) -> ExecutorResult<wreq::Client> {
    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url).map_err(|err| ExecutorError::Other(err.to_string()))?,
        );
    }
    builder
        .build()
        .map_err(|err| ExecutorError::Other(err.to_string()))
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}
