//! HTTP plumbing shared by every service.

use crate::codec::CodecOptions;
use crate::config::KouchConfig;
use crate::error::{KouchError, KouchResult};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Holds the configured HTTP clients and builds authenticated requests.
///
/// Two clients are kept: single-shot calls carry a total request timeout,
/// while the change feed only bounds the connect phase because its body
/// never ends.
#[derive(Debug)]
pub struct HttpContext {
    config: Arc<KouchConfig>,
    base_url: String,
    client: Client,
    stream_client: Client,
}

impl HttpContext {
    pub fn new(config: KouchConfig) -> KouchResult<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(KouchError::Config("base_url is empty".to_string()));
        }
        if config.class_field.trim().is_empty() {
            return Err(KouchError::Config("class_field is blank".to_string()));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        let stream_client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            base_url,
            client,
            stream_client,
        })
    }

    pub fn config(&self) -> &KouchConfig {
        &self.config
    }

    pub fn codec(&self) -> CodecOptions {
        CodecOptions::from_config(&self.config)
    }

    /// Joins percent-encoded path segments onto the base URL.
    pub fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    /// Builds a single-shot request with credentials applied.
    pub fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.url(segments);
        debug!("{} {}", method, url);
        self.authorize(self.client.request(method, url))
    }

    /// Builds a long-lived streaming request with credentials applied.
    pub fn stream_request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.url(segments);
        debug!("{} {} (stream)", method, url);
        self.authorize(self.stream_client.request(method, url))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    /// Sends a request and reads the whole body as text.
    pub async fn send(&self, builder: RequestBuilder) -> KouchResult<(StatusCode, String)> {
        let response = builder.send().await?;
        read_text(response).await
    }
}

async fn read_text(response: Response) -> KouchResult<(StatusCode, String)> {
    let status = response.status();
    let text = response.text().await?;
    debug!("-> {} ({} bytes)", status, text.len());
    Ok((status, text))
}
