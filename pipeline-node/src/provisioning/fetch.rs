use async_trait::async_trait;
use std::{path::Path, time::Duration};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{NodeError, Result};

/// Downloads a bundle archive to a local file.
#[async_trait]
pub trait BundleFetcher: Send + Sync {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<()>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| NodeError::ProvisioningError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl BundleFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<()> {
        info!("Downloading model bundle from {}", url);

        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let mut file = File::create(destination).await?;
        let mut written: u64 = 0;

        // Bundles can be large; never hold more than one chunk in memory.
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Wrote {} bytes to {}", written, destination.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
    };

    /// Serves one request with the given status line and chunked body parts.
    async fn serve_once(status: &'static str, parts: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;

            let head = format!("HTTP/1.1 {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n", status);
            socket.write_all(head.as_bytes()).await.unwrap();
            for part in parts {
                socket.write_all(format!("{:x}\r\n", part.len()).as_bytes()).await.unwrap();
                socket.write_all(&part).await.unwrap();
                socket.write_all(b"\r\n").await.unwrap();
                socket.flush().await.unwrap();
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
        });

        format!("http://{}/bundle.zip", address)
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut request = Vec::new();
        let mut buffer = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let read = socket.read(&mut buffer).await.unwrap();
            if read == 0 {
                break;
            }
            request.extend_from_slice(&buffer[..read]);
        }
    }

    fn destination() -> PathBuf {
        std::env::temp_dir().join(format!("edgeguard-fetch-{}.zip", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_chunked_body_is_written_to_disk() {
        let parts: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 64 * 1024]).collect();
        let expected: Vec<u8> = parts.concat();
        let url = serve_once("200 OK", parts).await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), false).unwrap();
        let path = destination();
        fetcher.fetch(&url, &path).await.unwrap();

        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written.len(), expected.len());
        assert_eq!(written, expected);
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_status_fails() {
        let url = serve_once("404 Not Found", vec![b"missing".to_vec()]).await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), false).unwrap();
        let path = destination();
        assert!(fetcher.fetch(&url, &path).await.is_err());
        assert!(!path.exists());
    }
}
