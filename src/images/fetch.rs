use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::images::{detect_image_type, ImageError};

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Loads the raw bytes behind an image URL.
///
/// Fetchers never go through the interceptor, so loading the bytes cannot
/// recurse into another compression pipeline.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedImage, ImageError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: u64) -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedImage, ImageError> {
        let response = self
            .client
            .get(url.clone())
            .header("Accept", "image/avif,image/webp,image/*,*/*;q=0.8")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::error!("Image request for {} failed with status: {}", url, status);
            return Err(ImageError::StatusError(status.as_u16()));
        }

        // Get the content-type from headers or default to octet-stream
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let data = response.bytes().await?.to_vec();

        // If content type is missing or generic, try to detect from image data
        let content_type = if content_type == "application/octet-stream" || content_type.is_empty() {
            detect_image_type(&data).to_string()
        } else {
            content_type
        };

        Ok(FetchedImage { data, content_type })
    }
}

/// Serves local images straight from the site's static directory.
pub struct FsFetcher {
    root: PathBuf,
}

impl FsFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &Url) -> Result<PathBuf, ImageError> {
        let decoded = urlencoding::decode(url.path())
            .map_err(|_| ImageError::NotFound(url.path().to_string()))?;
        let mut path = self.root.clone();
        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(ImageError::NotFound(url.path().to_string())),
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl ImageFetcher for FsFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedImage, ImageError> {
        let path = self.resolve(url)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageError::NotFound(url.path().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let content_type = detect_image_type(&data).to_string();
        Ok(FetchedImage { data, content_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Answers a single request with a canned HTTP response
    async fn serve_once(response: Vec<u8>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        Url::parse(&format!("http://{}/images/photo.png", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_http_fetcher_maps_error_status() {
        let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()).await;
        let fetcher = HttpFetcher::new(5).unwrap();

        assert!(matches!(fetcher.fetch(&url).await, Err(ImageError::StatusError(404))));
    }

    #[tokio::test]
    async fn test_http_fetcher_detects_missing_content_type() {
        let body = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A];
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);
        let url = serve_once(response).await;
        let fetcher = HttpFetcher::new(5).unwrap();

        let fetched = fetcher.fetch(&url).await.unwrap();
        assert_eq!(fetched.content_type, "image/png");
        assert_eq!(fetched.data, body);
    }

    #[tokio::test]
    async fn test_http_fetcher_keeps_declared_content_type() {
        let body = b"RIFF0000WEBP";
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/webp\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        let url = serve_once(response).await;
        let fetcher = HttpFetcher::new(5).unwrap();

        let fetched = fetcher.fetch(&url).await.unwrap();
        assert_eq!(fetched.content_type, "image/webp");
    }

    #[tokio::test]
    async fn test_fs_fetcher_reads_root_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::write(dir.path().join("images/a b.png"), [0x89, 0x50, 0x4E, 0x47, 0, 0]).unwrap();

        let fetcher = FsFetcher::new(dir.path());
        let url = Url::parse("http://localhost:8000/images/a%20b.png").unwrap();
        let fetched = fetcher.fetch(&url).await.unwrap();

        assert_eq!(fetched.content_type, "image/png");
        assert_eq!(fetched.data.len(), 6);
    }

    #[tokio::test]
    async fn test_fs_fetcher_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FsFetcher::new(dir.path());
        let url = Url::parse("http://localhost:8000/images/missing.jpg").unwrap();

        assert!(matches!(fetcher.fetch(&url).await, Err(ImageError::NotFound(_))));
    }

    #[test]
    fn test_fs_fetcher_rejects_traversal() {
        let fetcher = FsFetcher::new("/srv/site");
        // Url normalises dot segments, an encoded slash survives parsing
        let url = Url::parse("http://localhost:8000/images/..%2F..%2Fetc/passwd").unwrap();

        assert!(fetcher.resolve(&url).is_err());
    }
}
