//! Content fetcher for remote URLs and local paths.
//!
//! Remote fetches send `HEAD` first (falling back to `GET` when the
//! server answers 405 or 400), reject a declared Content-Length over the
//! limit without downloading, then stream the body and abort as soon as the
//! accumulated size reaches the limit.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, Response, StatusCode, Url};

use gleaner_core::config::FetchConfig;
use gleaner_core::error::{AppError, FetchError};
use gleaner_core::models::FetchedContent;
use gleaner_core::traits::ContentSource;

/// Customizes the outbound HTTP session before any fetch (headers, auth,
/// proxies).
pub trait SessionHook: Send + Sync {
    fn update_session(&self, builder: ClientBuilder) -> ClientBuilder;
}

/// Adds fixed headers to every request.
#[derive(Debug, Clone, Default)]
pub struct HeaderHook {
    headers: HeaderMap,
}

impl HeaderHook {
    /// Parses `Name: value` specifications.
    ///
    /// # Examples
    ///
    /// ```
    /// use gleaner_client::HeaderHook;
    ///
    /// assert!(HeaderHook::parse(["X-Api-Key: secret"]).is_ok());
    /// assert!(HeaderHook::parse(["no separator"]).is_err());
    /// ```
    pub fn parse<I, S>(specs: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut headers = HeaderMap::new();
        for spec in specs {
            let spec = spec.as_ref();
            let (name, value) = spec.split_once(':').ok_or_else(|| {
                AppError::ConfigError(format!("header '{}' must be NAME:VALUE", spec))
            })?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| AppError::ConfigError(format!("header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| AppError::ConfigError(format!("header value for {}: {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(Self { headers })
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl SessionHook for HeaderHook {
    fn update_session(&self, builder: ClientBuilder) -> ClientBuilder {
        builder.default_headers(self.headers.clone())
    }
}

/// Appends the page parameter for pages after the first.
///
/// # Examples
///
/// ```
/// use gleaner_client::paged_url;
///
/// assert_eq!(paged_url("https://example.org/data.json", 1), "https://example.org/data.json");
/// assert_eq!(paged_url("https://example.org/data.json", 2), "https://example.org/data.json?page=2");
/// assert_eq!(paged_url("https://example.org/api?q=x", 3), "https://example.org/api?q=x&page=3");
/// ```
pub fn paged_url(url: &str, page: u32) -> String {
    if page <= 1 {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}page={}", url, separator, page)
}

/// Guesses a serialization format from the file extension, then from the
/// first non-blank character of the content.
///
/// # Examples
///
/// ```
/// use gleaner_client::guess_format;
///
/// assert_eq!(guess_format("catalog.ttl", None), Some("turtle"));
/// assert_eq!(guess_format("catalog", Some("  [{\"identifier\": \"a\"}]")), Some("json"));
/// assert_eq!(guess_format("catalog", None), None);
/// ```
pub fn guess_format(path: &str, content: Option<&str>) -> Option<&'static str> {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let by_extension = match extension.as_deref() {
        Some("rdf") | Some("xml") | Some("owl") => Some("xml"),
        Some("ttl") => Some("turtle"),
        Some("n3") => Some("n3"),
        Some("nt") => Some("nt"),
        Some("jsonld") => Some("json-ld"),
        Some("json") => Some("json"),
        Some("trig") => Some("trig"),
        Some("nq") => Some("nquads"),
        Some("trix") => Some("trix"),
        _ => None,
    };
    if by_extension.is_some() {
        return by_extension;
    }

    match content?.trim_start().chars().next()? {
        '{' | '[' => Some("json"),
        '<' => Some("xml"),
        _ => None,
    }
}

fn is_local(locator: &str) -> bool {
    !locator.to_ascii_lowercase().starts_with("http")
}

/// HTTP and filesystem [`ContentSource`].
///
/// # Examples
///
/// ```no_run
/// use gleaner_client::ContentFetcher;
/// use gleaner_core::{ContentSource, FetchConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = ContentFetcher::new(FetchConfig::default())?;
/// let page = fetcher.fetch("https://data.example.org/data.json", 1, None).await?;
/// println!("{} bytes of {:?}", page.content.len(), page.content_type);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ContentFetcher {
    client: Client,
    config: FetchConfig,
}

impl ContentFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, AppError> {
        Self::with_hooks(config, &[])
    }

    /// Builds the HTTP session, letting each hook adjust it in order.
    pub fn with_hooks(config: FetchConfig, hooks: &[&dyn SessionHook]) -> Result<Self, AppError> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout);
        for hook in hooks {
            builder = hook.update_session(builder);
        }
        let client = builder
            .build()
            .map_err(|e| AppError::Generic(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    async fn fetch_local(
        &self,
        path: &str,
        content_type: Option<&str>,
    ) -> Result<FetchedContent, FetchError> {
        let path_buf = PathBuf::from(path);
        if !tokio::fs::try_exists(&path_buf).await.unwrap_or(false) {
            return Err(FetchError::LocalPathNotFound(path_buf));
        }

        let content = tokio::fs::read_to_string(&path_buf)
            .await
            .map_err(|e| FetchError::Io {
                path: path_buf.clone(),
                message: e.to_string(),
            })?;
        let content_type = content_type
            .map(str::to_string)
            .or_else(|| guess_format(path, Some(&content)).map(str::to_string));

        tracing::debug!(path, bytes = content.len(), "Read local file");
        Ok(FetchedContent {
            content,
            content_type,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Response, FetchError> {
        request.send().await.map_err(|e| map_reqwest_error(url, e))
    }

    /// Rejects a response whose Content-Length is over the limit before any
    /// of its body is read.
    fn check_declared_length(&self, response: &Response, url: &str) -> Result<(), FetchError> {
        let limit = self.config.max_file_size;
        match declared_length(response) {
            Some(declared) if declared > limit => {
                tracing::warn!(url, limit, declared, "Remote file is too big, not downloading");
                Err(FetchError::SizeExceeded {
                    limit,
                    actual: Some(declared),
                })
            }
            _ => Ok(()),
        }
    }

    /// Streams the body, checking the cumulative size every `chunk_size`
    /// bytes.
    async fn read_limited(&self, response: Response, url: &str) -> Result<String, FetchError> {
        let limit = self.config.max_file_size;
        let chunk_size = self.config.chunk_size.max(1);
        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_reqwest_error(url, e))?;
            for piece in chunk.chunks(chunk_size) {
                body.extend_from_slice(piece);
                if body.len() as u64 >= limit {
                    tracing::warn!(url, limit, "Remote file is too big, aborting download");
                    return Err(FetchError::SizeExceeded {
                        limit,
                        actual: None,
                    });
                }
            }
        }

        Ok(decode_body(url, body))
    }
}

#[async_trait]
impl ContentSource for ContentFetcher {
    async fn fetch(
        &self,
        locator: &str,
        page: u32,
        content_type: Option<&str>,
    ) -> Result<FetchedContent, FetchError> {
        if is_local(locator) {
            return self.fetch_local(locator, content_type).await;
        }

        let url = paged_url(locator, page);
        let parsed =
            Url::parse(&url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;
        tracing::debug!(url = %url, page, "Getting file");

        let head = self.send(self.client.head(parsed.clone()), &url).await?;
        let (response, did_get) = match head.status() {
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::BAD_REQUEST => {
                (self.send(self.client.get(parsed.clone()), &url).await?, true)
            }
            _ => (head, false),
        };
        check_status(&url, &response)?;
        self.check_declared_length(&response, &url)?;

        let response = if did_get {
            response
        } else {
            let response = self.send(self.client.get(parsed), &url).await?;
            check_status(&url, &response)?;
            self.check_declared_length(&response, &url)?;
            response
        };

        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let content = self.read_limited(response, &url).await?;
        tracing::debug!(url = %url, bytes = content.len(), "Fetched content");

        Ok(FetchedContent {
            content,
            content_type: content_type.map(str::to_string).or(header_type),
        })
    }
}

/// Decodes a body as UTF-8. Invalid sequences are replaced and logged.
fn decode_body(url: &str, body: Vec<u8>) -> String {
    match String::from_utf8(body) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(
                url,
                valid_up_to = e.utf8_error().valid_up_to(),
                "Content is not valid UTF-8, replacing invalid bytes"
            );
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}

/// Content-Length as sent by the server.
fn declared_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn check_status(url: &str, response: &Response) -> Result<(), FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound {
            url: url.to_string(),
        });
    }
    Err(FetchError::Http {
        url: url.to_string(),
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or_default().to_string(),
    })
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout {
            url: url.to_string(),
        };
    }
    FetchError::Connection {
        url: url.to_string(),
        message: err.to_string(),
    }
}
