//! Network side of the image loader.

use async_trait::async_trait;
use tracing::debug;

use crate::error::RemoteError;
use crate::remote::http::error_for;

/// Downloads encoded image bytes.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch the bytes behind `uri`.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the download fails.
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, RemoteError>;
}

/// [`ImageFetcher`] over plain HTTP(S) GET.
#[derive(Debug, Clone, Default)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    /// Creates a fetcher sharing the given client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, RemoteError> {
        debug!(%uri, "Downloading image");
        let response = self.client.get(uri).send().await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::{client, serve_once};

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let (base, request) = serve_once(200, "PNGDATA").await;
        let fetcher = HttpImageFetcher::new(client());

        let bytes = fetcher.fetch(&format!("{base}/img/a.png")).await.unwrap();

        assert_eq!(bytes, b"PNGDATA");
        assert!(request.await.unwrap().starts_with("GET /img/a.png"));
    }

    #[tokio::test]
    async fn test_missing_image_is_protocol_error() {
        let (base, _request) = serve_once(404, "").await;
        let fetcher = HttpImageFetcher::new(client());

        let err = fetcher.fetch(&format!("{base}/gone.png")).await.unwrap_err();

        assert!(matches!(err, RemoteError::Protocol(_)));
    }
}
