use std::sync::Mutex;

use reqwest::header::{AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::debug;

use super::PluginError;
use crate::config::ServiceConfig;

#[derive(Debug)]
pub enum Download {
    /// The server's copy matches the last one fetched.
    NotModified,
    Bundle { bytes: Vec<u8>, etag: Option<String> },
}

/// Fetches one resource from a service, remembering the last ETag.
#[derive(Debug)]
pub struct Downloader {
    client: reqwest::Client,
    url: String,
    service: ServiceConfig,
    etag: Mutex<Option<String>>,
}

impl Downloader {
    pub fn new(client: reqwest::Client, service: ServiceConfig, resource: &str) -> Self {
        let url = format!(
            "{}/{}",
            service.url.trim_end_matches('/'),
            resource.trim_start_matches('/')
        );
        Self {
            client,
            url,
            service,
            etag: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> Result<Download, PluginError> {
        let mut request = self.client.get(&self.url).timeout(self.service.timeout());
        if let Some(auth) = self.service.authorization() {
            request = request.header(AUTHORIZATION, auth);
        }
        let known = self.etag.lock().expect("etag lock poisoned").clone();
        if let Some(etag) = &known {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(url = %self.url, "bundle not modified");
            return Ok(Download::NotModified);
        }
        if !status.is_success() {
            return Err(PluginError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        *self.etag.lock().expect("etag lock poisoned") = etag.clone();
        debug!(url = %self.url, size = bytes.len(), "bundle downloaded");
        Ok(Download::Bundle { bytes, etag })
    }
}
