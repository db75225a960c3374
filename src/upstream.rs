//! Upstream inference API calls, each routed through one proxy.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};

use crate::api::types::{AudioUpload, ChatCompletionRequest, ModelList};
use crate::config::{ConfigError, UpstreamConfig};
use crate::dispatch::AttemptError;
use crate::pool::{proxied_client, ProxyAddress};
use crate::relay;

const SOURCE_HEADER: HeaderName = HeaderName::from_static("x-deepinfra-source");

/// Marker the upstream puts in bodies for models this client may not use.
const NOT_AUTHENTICATED: &str = "Not authenticated";

/// Builds and sends upstream requests through a given proxy.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    config: UpstreamConfig,
    headers: HeaderMap,
    connect_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig, connect_timeout: Duration) -> Result<Self, ConfigError> {
        let header = |name: &str, value: &str| {
            HeaderValue::from_str(value).map_err(|_| {
                ConfigError::Validation(format!("{} is not a valid header value", name))
            })
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            SOURCE_HEADER,
            header("upstream.source_header", &config.source_header)?,
        );
        headers.insert(USER_AGENT, header("upstream.user_agent", &config.user_agent)?);

        Ok(Self {
            config: config.clone(),
            headers,
            connect_timeout,
        })
    }

    fn client(&self, proxy: &ProxyAddress, timeout: Option<Duration>) -> Result<Client, AttemptError> {
        proxied_client(proxy, timeout, self.connect_timeout).map_err(AttemptError::transport)
    }

    /// POST a chat completion. Non-2xx responses are attempt failures.
    ///
    /// Streaming calls get no whole-request timeout: the body may legitimately
    /// run longer than `timeout`, which then bounds the first frame and the
    /// gap between later frames instead.
    pub async fn chat(
        &self,
        proxy: &ProxyAddress,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, AttemptError> {
        let timeout = (!request.stream).then_some(timeout);
        let response = self
            .client(proxy, timeout)?
            .post(self.config.chat_url())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await
            .map_err(AttemptError::transport)?;

        relay::accept(response).await
    }

    /// POST an audio file for transcription.
    pub async fn transcribe(
        &self,
        proxy: &ProxyAddress,
        upload: &AudioUpload,
        timeout: Duration,
    ) -> Result<reqwest::Response, AttemptError> {
        let mut audio = Part::bytes(upload.audio.to_vec()).file_name(upload.file_name.clone());
        if let Some(mime) = &upload.content_type {
            audio = audio.mime_str(mime).map_err(AttemptError::transport)?;
        }

        let mut form = Form::new()
            .part("audio", audio)
            .text("task", upload.task.clone());
        if let Some(language) = &upload.language {
            form = form.text("language", language.clone());
        }

        let url = self.config.transcription_url(upload.model.as_deref());
        let response = self
            .client(proxy, Some(timeout))?
            .post(url)
            .headers(self.headers.clone())
            .multipart(form)
            .send()
            .await
            .map_err(AttemptError::transport)?;

        relay::accept(response).await
    }

    /// GET the upstream model list and return the ids.
    pub async fn list_models(
        &self,
        proxy: &ProxyAddress,
        timeout: Duration,
    ) -> Result<Vec<String>, AttemptError> {
        let response = self
            .client(proxy, Some(timeout))?
            .get(self.config.models_url())
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(AttemptError::transport)?;

        let response = relay::accept(response).await?;
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| AttemptError::Relay(format!("invalid model list: {}", e.without_url())))?;
        Ok(list.ids())
    }

    /// Send a tiny chat completion to see whether `model` is usable.
    ///
    /// Any upstream answer is about the model: only a 200 without the
    /// "Not authenticated" marker counts as accessible. Only transport and
    /// body read failures are attempt failures.
    pub async fn trial_chat(
        &self,
        proxy: &ProxyAddress,
        model: &str,
        timeout: Duration,
    ) -> Result<bool, AttemptError> {
        let response = self
            .client(proxy, Some(timeout))?
            .post(self.config.chat_url())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&ChatCompletionRequest::trial(model))
            .send()
            .await
            .map_err(AttemptError::transport)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AttemptError::Relay(e.without_url().to_string()))?;

        if body.contains(NOT_AUTHENTICATED) {
            return Ok(false);
        }
        Ok(status == StatusCode::OK)
    }
}
