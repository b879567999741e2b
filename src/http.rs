use http_body_util::{BodyExt, Empty, Full};
use hyper::Request;
use hyper::body::{Bytes, Incoming};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{Error, Result};

/// Longest error body excerpt carried in [`Error::Api`].
const ERROR_PREVIEW_CHARS: usize = 500;

pub type Response = hyper::Response<Incoming>;

/// Shared HTTP/1.1 + HTTP/2 client for chat and model list calls.
pub struct HttpClient {
    full_client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    empty_client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl HttpClient {
    pub fn new() -> Self {
        // Already installed by the host application is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let full_client = Client::builder(TokioExecutor::new()).build(connector.clone());
        let empty_client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            full_client,
            empty_client,
        }
    }

    /// POST `body` and return the response with its body unread, whatever
    /// the status.
    pub async fn post_raw(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<Response> {
        let mut req = Request::builder().method("POST").uri(url);

        for (name, value) in headers {
            req = req.header(*name, *value);
        }

        let req = req
            .body(Full::new(body))
            .map_err(|e| Error::Http(e.to_string()))?;

        self.full_client
            .request(req)
            .await
            .map_err(|e| Error::Http(e.to_string()))
    }

    /// GET with custom headers; non-2xx statuses become [`Error::Api`].
    pub async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>> {
        let mut req = Request::builder().method("GET").uri(url);

        for (name, value) in headers {
            req = req.header(*name, *value);
        }

        let req = req
            .body(Empty::new())
            .map_err(|e| Error::Http(e.to_string()))?;

        let response = self
            .empty_client
            .request(req)
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(body.to_bytes().to_vec())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a failed response into [`Error::Api`] with a short body excerpt.
pub async fn api_error(response: Response) -> Error {
    let status = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .ok()
        .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
        .unwrap_or_default();
    let message: String = body.chars().take(ERROR_PREVIEW_CHARS).collect();

    debug!(status, message = %message, "Upstream returned error status");
    Error::Api { status, message }
}


#[cfg(test)]
mod tests {
    use super::testing::{Canned, serve};
    use super::*;

    #[tokio::test]
    async fn test_get_success_with_headers() {
        let (base, recorded) = serve(vec![Canned::json(200, r#"{"data":[]}"#)]).await;
        let client = HttpClient::new();

        let body = client
            .get(&format!("{base}/v1/models"), &[("Authorization", "Bearer sk-1")])
            .await
            .unwrap();
        assert_eq!(body, br#"{"data":[]}"#);

        let requests = recorded.lock();
        assert_eq!(requests[0].request_line(), "GET /v1/models HTTP/1.1");
        assert_eq!(requests[0].header("authorization").as_deref(), Some("Bearer sk-1"));
    }

    #[tokio::test]
    async fn test_get_error_status() {
        let (base, _) = serve(vec![Canned::json(401, r#"{"error":"bad key"}"#)]).await;
        let err = HttpClient::new().get(&base, &[]).await.unwrap_err();
        match err {
            Error::Api { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("bad key"));
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_raw_keeps_body_unread() {
        let (base, recorded) =
            serve(vec![Canned::event_stream(&[b"data: 1\n", b"data: 2\n"])]).await;
        let response = HttpClient::new()
            .post_raw(
                &format!("{base}/chat"),
                &[("Content-Type", "application/json")],
                Bytes::from_static(b"{\"x\":1}"),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"data: 1\ndata: 2\n");
        assert_eq!(recorded.lock()[0].body, "{\"x\":1}");
    }

    #[tokio::test]
    async fn test_connection_refused_is_http_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpClient::new()
            .get(&format!("http://{addr}/"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let err = HttpClient::new().get("not a uri", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }
}
