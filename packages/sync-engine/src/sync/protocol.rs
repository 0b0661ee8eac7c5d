//! Wire protocol for exchanging document updates with a remote sync peer
//! (§4.4 "transport"). The scheduler talks to one [`SyncTransport`]; network
//! transport choice is pluggable so tests never touch a socket.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use sync_core::{ErrorKind, Result, SyncError};

/// Exchanges one document's pending local changes (MsgPack-encoded
/// [`sync_core::UpdateBlob`]) with a remote peer and returns whatever the
/// peer has that the caller doesn't, also MsgPack-encoded. Kept at the byte
/// level rather than typed request/response structs so a transport can be
/// implemented without depending on `sync-core`'s wire types at all.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn exchange(
        &self,
        doc_id: &str,
        body: Vec<u8>,
        state_vector: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<u8>>;
}

/// Default transport: MsgPack-over-HTTP POST to a fixed endpoint, mirroring
/// the server's `/sync` handler.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into() }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn exchange(
        &self,
        doc_id: &str,
        body: Vec<u8>,
        state_vector: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/msgpack")
            .header("x-doc-id", doc_id)
            .timeout(timeout)
            .body(body);
        if let Some(sv) = state_vector {
            request = request.header("x-state-vector", hex_header(&sv));
        }

        let response = request.send().await.map_err(|e| SyncError::with_source(ErrorKind::Network, "sync request failed", e))?;

        if !response.status().is_success() {
            return Err(SyncError::network(format!("sync peer returned status {}", response.status())));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| SyncError::with_source(ErrorKind::Network, "failed to read sync response body", e))
    }
}

/// HTTP header values must be visible ASCII; opaque bytes go out as hex
/// rather than pulling in a dedicated encoding dependency for one header.
fn hex_header(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

type ExchangeFn = dyn Fn(String, Vec<u8>, Option<Vec<u8>>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>> + Send + Sync;

/// Closure-backed transport used by tests and demos in place of a real peer.
pub struct FnTransport {
    exchange_fn: Box<ExchangeFn>,
}

impl FnTransport {
    pub fn new<F, Fut>(exchange_fn: F) -> Self
    where
        F: Fn(String, Vec<u8>, Option<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        Self { exchange_fn: Box::new(move |doc_id, body, sv| Box::pin(exchange_fn(doc_id, body, sv))) }
    }
}

#[async_trait]
impl SyncTransport for FnTransport {
    async fn exchange(&self, doc_id: &str, body: Vec<u8>, state_vector: Option<Vec<u8>>, _timeout: Duration) -> Result<Vec<u8>> {
        (self.exchange_fn)(doc_id.to_string(), body, state_vector).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_transport_invokes_closure() {
        let transport = FnTransport::new(|_doc_id, body, _sv| async move { Ok(body) });

        let response = transport.exchange("d1", vec![1, 2, 3], None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response, vec![1, 2, 3]);
    }
}
