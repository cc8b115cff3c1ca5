//! HTTP client pool keyed by base URL.
//!
//! Every oracle client targeting the same endpoint shares one `reqwest::Client`,
//! so DNS lookups, TLS handshakes and idle keep-alive connections are reused
//! across the many small calls a negotiation makes.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    /// Global cache of HTTP clients indexed by base URL.
    static ref CLIENT_POOL: Mutex<HashMap<String, reqwest::Client>> = Mutex::new(HashMap::new());
}

/// Get or create the shared HTTP client for `base_url`.
///
/// The client keeps idle connections alive for 90 seconds, sends TCP keepalive
/// probes every 60 seconds and gives up connecting after 30 seconds. There is no
/// whole-request timeout: oracle calls are slow and the only wall-clock budget
/// is the one configured on the scenario.
pub fn get_or_create_client(base_url: &str) -> Result<reqwest::Client, reqwest::Error> {
    let mut pool = CLIENT_POOL.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(client) = pool.get(base_url) {
        return Ok(client.clone());
    }

    let client = reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    pool.insert(base_url.to_string(), client.clone());
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_contains(url: &str) -> bool {
        CLIENT_POOL
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(url)
    }

    #[test]
    fn test_client_pool_reuses_entry() {
        let url = "https://api.groq.com/openai/v1";
        get_or_create_client(url).unwrap();
        get_or_create_client(url).unwrap();
        assert!(pool_contains(url));
    }

    #[test]
    fn test_distinct_base_urls_get_distinct_entries() {
        let a = "https://oracle-a.example.com/v1";
        let b = "https://oracle-b.example.com/v1";
        get_or_create_client(a).unwrap();
        get_or_create_client(b).unwrap();
        assert!(pool_contains(a));
        assert!(pool_contains(b));
    }
}
