//! Rule list download.
//!
//! This module provides:
//! - The [`Fetcher`] seam used by source handlers
//! - [`HttpFetcher`], a blocking HTTP client with gzip detection
//! - [`MemoryFetcher`], an in-memory fetcher for tests and offline use

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use parking_lot::Mutex;
use url::Url;

use crate::{Error, Result};

/// Retrieves the raw bytes behind a URL.
///
/// Called from worker threads, never from the owning sequence.
pub trait Fetcher: Send + Sync {
    fn get(&self, url: &Url) -> Result<Vec<u8>>;
}

/// Check if data is gzip compressed.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Decompress `data` if it carries a gzip header, otherwise return it as is.
pub fn maybe_decompress(data: Vec<u8>) -> Result<Vec<u8>> {
    if !is_gzip(&data) {
        return Ok(data);
    }
    let mut decoder = GzDecoder::new(&data[..]);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Download(format!("gzip decompression failed: {}", e)))?;
    Ok(out)
}

/// Blocking HTTP(S) fetcher.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("k2filter/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Fetcher for HttpFetcher {
    fn get(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.agent.get(url.as_str()).call().map_err(|e| match e {
            ureq::Error::Status(code, _) => Error::Download(format!("HTTP error: {}", code)),
            ureq::Error::Transport(t) => Error::Download(format!("transport error: {}", t)),
        })?;

        let mut raw_data = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut raw_data)
            .map_err(|e| Error::Download(format!("failed to read response: {}", e)))?;

        let raw_len = raw_data.len();
        let data = maybe_decompress(raw_data)?;
        log::debug!(
            "Downloaded {}: {} bytes (transferred {} bytes)",
            url,
            data.len(),
            raw_len
        );
        Ok(data)
    }
}

/// Serves canned responses from memory.
///
/// Clones share the same responses and request counter.
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    responses: Arc<Mutex<HashMap<String, std::result::Result<Vec<u8>, String>>>>,
    requests: Arc<AtomicUsize>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` for `url`.
    pub fn insert(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.responses.lock().insert(url.to_string(), Ok(body.into()));
    }

    /// Fail requests for `url` with `message`.
    pub fn fail(&self, url: &str, message: &str) {
        self.responses
            .lock()
            .insert(url.to_string(), Err(message.to_string()));
    }

    pub fn remove(&self, url: &str) {
        self.responses.lock().remove(url);
    }

    /// Number of requests served so far, failed ones included.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Fetcher for MemoryFetcher {
    fn get(&self, url: &Url) -> Result<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().get(url.as_str()) {
            Some(Ok(body)) => maybe_decompress(body.clone()),
            Some(Err(message)) => Err(Error::Download(message.clone())),
            None => Err(Error::Download(format!("HTTP error: 404 for {}", url))),
        }
    }
}
