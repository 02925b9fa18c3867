//! Placement-service (PD) API.
//!
//! Every call takes the endpoint (`host:port`) explicitly; a cluster's
//! endpoint lives in its `Placement` record, so one client serves all
//! clusters. A 404 answer maps to [`PdError::NotFound`] so callers can tell
//! "unknown to placement" apart from transport failures; deletes treat 404
//! as success.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{PdError, PdResult};
use crate::http_client::{self, Response};
use crate::types::*;

/// Default timeout for a single placement request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const API_PREFIX: &str = "/pd/api/v1";

/// Queries and commands against a cluster's placement service.
#[async_trait]
pub trait PlacementApi: Send + Sync {
    /// All stores known to placement, including tombstones.
    async fn list_stores(&self, endpoint: &str) -> PdResult<Vec<StoreInfo>>;

    async fn get_store(&self, endpoint: &str, id: u64) -> PdResult<StoreInfo>;

    /// Demote a store: placement marks it Offline and migrates its data
    /// away; it turns Tombstone once empty.
    async fn delete_store(&self, endpoint: &str, id: u64) -> PdResult<()>;

    async fn leader(&self, endpoint: &str) -> PdResult<MemberInfo>;

    async fn members(&self, endpoint: &str) -> PdResult<Vec<MemberInfo>>;

    async fn delete_member(&self, endpoint: &str, name: &str) -> PdResult<()>;
}

/// hyper-backed [`PlacementApi`].
#[derive(Debug, Clone)]
pub struct PdClient {
    timeout: Duration,
}

impl Default for PdClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PdClient {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, path: &str) -> PdResult<T> {
        let resp = http_client::send(http::Method::GET, endpoint, path, self.timeout).await?;
        let resp = check_status(endpoint, path, resp)?;
        serde_json::from_slice(&resp.body).map_err(|e| PdError::Decode {
            uri: format!("http://{endpoint}{path}"),
            message: e.to_string(),
        })
    }

    async fn delete(&self, endpoint: &str, path: &str) -> PdResult<()> {
        let resp = http_client::send(http::Method::DELETE, endpoint, path, self.timeout).await?;
        match check_status(endpoint, path, resp) {
            Ok(_) => Ok(()),
            Err(PdError::NotFound(what)) => {
                debug!(%what, "delete target already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn check_status(endpoint: &str, path: &str, resp: Response) -> PdResult<Response> {
    if resp.status.is_success() {
        return Ok(resp);
    }
    let uri = format!("http://{endpoint}{path}");
    if resp.status == http::StatusCode::NOT_FOUND {
        return Err(PdError::NotFound(uri));
    }
    Err(PdError::Status {
        uri,
        status: resp.status.as_u16(),
        body: String::from_utf8_lossy(&resp.body).trim().to_string(),
    })
}

#[async_trait]
impl PlacementApi for PdClient {
    async fn list_stores(&self, endpoint: &str) -> PdResult<Vec<StoreInfo>> {
        let resp: StoresResponse = self
            .get(endpoint, &format!("{API_PREFIX}/stores"))
            .await?;
        debug!(%endpoint, count = resp.count, "stores listed");
        Ok(resp.stores.into_iter().map(|s| s.store).collect())
    }

    async fn get_store(&self, endpoint: &str, id: u64) -> PdResult<StoreInfo> {
        let resp: StoreEnvelope = self
            .get(endpoint, &format!("{API_PREFIX}/store/{id}"))
            .await?;
        Ok(resp.store)
    }

    async fn delete_store(&self, endpoint: &str, id: u64) -> PdResult<()> {
        self.delete(endpoint, &format!("{API_PREFIX}/store/{id}"))
            .await?;
        info!(%endpoint, store_id = id, "store deleted from placement");
        Ok(())
    }

    async fn leader(&self, endpoint: &str) -> PdResult<MemberInfo> {
        self.get(endpoint, &format!("{API_PREFIX}/leader")).await
    }

    async fn members(&self, endpoint: &str) -> PdResult<Vec<MemberInfo>> {
        let resp: MembersResponse = self
            .get(endpoint, &format!("{API_PREFIX}/members"))
            .await?;
        Ok(resp.members)
    }

    async fn delete_member(&self, endpoint: &str, name: &str) -> PdResult<()> {
        self.delete(endpoint, &format!("{API_PREFIX}/members/name/{name}"))
            .await?;
        info!(%endpoint, member = %name, "placement member deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one request with a canned status and body.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let resp = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(resp.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn list_stores_decodes_envelope() {
        let addr = serve_once(
            "200 OK",
            r#"{"count":1,"stores":[{"store":{"id":7,"address":"10.1.0.3:20160","state":0,"state_name":"Up"}}]}"#,
        )
        .await;
        let stores = PdClient::new().list_stores(&addr).await.unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].id, 7);
        assert!(stores[0].is_up());
    }

    #[tokio::test]
    async fn missing_store_is_not_found() {
        let addr = serve_once("404 Not Found", r#"{"error":"store not found"}"#).await;
        let err = PdClient::new().get_store(&addr, 9).await.unwrap_err();
        assert!(err.is_not_found(), "got {err}");
    }

    #[tokio::test]
    async fn delete_of_missing_store_succeeds() {
        let addr = serve_once("404 Not Found", "").await;
        PdClient::new().delete_store(&addr, 9).await.unwrap();
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_body() {
        let addr = serve_once("500 Internal Server Error", "raft not ready").await;
        let err = PdClient::new().leader(&addr).await.unwrap_err();
        match err {
            PdError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "raft not ready");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = PdClient::new()
            .with_timeout(Duration::from_millis(500))
            .members(&addr)
            .await
            .unwrap_err();
        assert!(
            matches!(err, PdError::Connect { .. } | PdError::Timeout { .. }),
            "got {err}"
        );
    }
}
