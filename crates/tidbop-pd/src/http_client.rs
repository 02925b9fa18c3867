//! Minimal HTTP/1 client over a fresh TCP connection per request.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use tracing::debug;

use crate::error::{PdError, PdResult};

pub(crate) struct Response {
    pub status: http::StatusCode,
    pub body: Bytes,
}

/// Send one request to `http://{address}{path}` and collect the body.
pub(crate) async fn send(
    method: http::Method,
    address: &str,
    path: &str,
    timeout: Duration,
) -> PdResult<Response> {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| PdError::Connect {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| PdError::Connect {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "tidbop/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| PdError::Connect {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| PdError::Connect {
                address: address.to_string(),
                message: e.to_string(),
            })?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| PdError::Decode {
                uri: uri.clone(),
                message: e.to_string(),
            })?
            .to_bytes();
        debug!(%method, %uri, %status, "placement request finished");
        Ok(Response { status, body })
    })
    .await;

    match result {
        Ok(resp) => resp,
        Err(_) => Err(PdError::Timeout { uri }),
    }
}
