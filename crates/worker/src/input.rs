//! Resolution of a job's `input_image_ref` to a file on local disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use im2vid_core::params::ImageSource;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Remote inputs larger than this are refused.
const MAX_INPUT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum InputFetchError {
    #[error("invalid input reference: {0}")]
    InvalidReference(String),

    #[error("failed to fetch {url}: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },

    #[error("fetching {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("input image is larger than {0} bytes")]
    TooLarge(usize),

    #[error("staged input {} does not exist", .0.display())]
    MissingStaged(PathBuf),

    #[error("input is not a supported image: {0}")]
    NotAnImage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads remote inputs and checks staged ones.
#[derive(Clone)]
pub struct InputFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl InputFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            max_bytes: MAX_INPUT_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Make the input available under `input_dir` and return its path.
    ///
    /// Remote images are written to `input_dir/input.<ext>` with the
    /// extension taken from the sniffed format. Staged files are used in
    /// place.
    pub async fn fetch(&self, reference: &str, input_dir: &Path) -> Result<PathBuf, InputFetchError> {
        let source = ImageSource::parse(reference)
            .map_err(|e| InputFetchError::InvalidReference(e.to_string()))?;

        match source {
            ImageSource::Remote(url) => self.fetch_remote(&url, input_dir).await,
            ImageSource::Staged(path) => {
                if !tokio::fs::try_exists(&path).await? {
                    return Err(InputFetchError::MissingStaged(path));
                }
                let head = read_head(&path).await?;
                sniff_extension(&head)?;
                Ok(path)
            }
        }
    }

    async fn fetch_remote(&self, url: &str, input_dir: &Path) -> Result<PathBuf, InputFetchError> {
        let request_err = |source| InputFetchError::Request {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(request_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(InputFetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(InputFetchError::TooLarge(self.max_bytes));
        }

        // Servers may omit Content-Length, so the limit is enforced while reading.
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(request_err)?;
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(InputFetchError::TooLarge(self.max_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }
        let ext = sniff_extension(&bytes)?;

        tokio::fs::create_dir_all(input_dir).await?;
        let path = input_dir.join(format!("input.{ext}"));
        tokio::fs::write(&path, &bytes).await?;

        tracing::debug!(url, path = %path.display(), bytes = bytes.len(), "Input image fetched");
        Ok(path)
    }
}

impl Default for InputFetcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_head(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut head = vec![0u8; 64];
    let n = file.read(&mut head).await?;
    head.truncate(n);
    Ok(head)
}

fn sniff_extension(bytes: &[u8]) -> Result<&'static str, InputFetchError> {
    let format = image::guess_format(bytes).map_err(|e| InputFetchError::NotAnImage(e.to_string()))?;
    format
        .extensions_str()
        .first()
        .copied()
        .ok_or_else(|| InputFetchError::NotAnImage(format!("{format:?}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
