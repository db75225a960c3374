//! Proxy candidate lists.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::Client;

use super::{CandidateSource, ProxyAddress};

/// Errors raised while fetching a candidate list.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to fetch candidate list: {0}")]
    Http(#[from] reqwest::Error),

    #[error("candidate source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read candidate file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("candidate source returned an empty list")]
    EmptyList,
}

/// Split a plaintext proxy list into addresses.
///
/// Tokens are separated by any whitespace. Duplicates are dropped, keeping
/// the first occurrence.
pub fn parse_candidates(body: &str) -> Vec<ProxyAddress> {
    let mut seen = HashSet::new();
    body.split_whitespace()
        .filter(|token| seen.insert(*token))
        .map(ProxyAddress::from)
        .collect()
}

/// Candidate source backed by a list provider URL or a local file.
pub struct HttpProxySource {
    location: String,
    client: Client,
}

impl HttpProxySource {
    /// Create a source for `location`. Anything that is not an `http(s)://`
    /// URL is read as a file path.
    pub fn new(location: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            location: location.into(),
            client,
        })
    }

    fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    async fn read_body(&self) -> Result<String, SourceError> {
        if self.is_remote() {
            let response = self
                .client
                .get(&self.location)
                .send()
                .await?
                .error_for_status()?;
            Ok(response.text().await?)
        } else {
            tokio::fs::read_to_string(&self.location)
                .await
                .map_err(|source| SourceError::Io {
                    path: self.location.clone(),
                    source,
                })
        }
    }
}

#[async_trait]
impl CandidateSource<ProxyAddress> for HttpProxySource {
    async fn fetch_candidates(&self) -> Result<Vec<ProxyAddress>, SourceError> {
        tracing::info!(source = %self.location, "Fetching proxy list");

        let body = self.read_body().await?;
        let mut candidates = parse_candidates(&body);
        if candidates.is_empty() {
            return Err(SourceError::EmptyList);
        }

        // Spread probe order so repeated refreshes don't favour the head of the list.
        candidates.shuffle(&mut rand::thread_rng());

        tracing::info!(count = candidates.len(), "Retrieved proxy candidates");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sorted(mut addrs: Vec<ProxyAddress>) -> Vec<String> {
        addrs.sort();
        addrs.into_iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_parse_newline_list() {
        let parsed = parse_candidates("1.1.1.1:80\n2.2.2.2:3128\r\n3.3.3.3:8080\n");
        assert_eq!(
            parsed.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
            vec!["1.1.1.1:80", "2.2.2.2:3128", "3.3.3.3:8080"]
        );
    }

    #[test]
    fn test_parse_mixed_whitespace_and_blank_lines() {
        let parsed = parse_candidates("  1.1.1.1:80 \t 2.2.2.2:81\n\n\n   http://3.3.3.3:82  \n");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2].as_str(), "http://3.3.3.3:82");
    }

    #[test]
    fn test_parse_drops_duplicates() {
        let parsed = parse_candidates("1.1.1.1:80\n1.1.1.1:80\n2.2.2.2:80");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_empty_body() {
        assert!(parse_candidates(" \n\t\n").is_empty());
    }

    #[tokio::test]
    async fn test_fetch_from_provider() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies"))
            .respond_with(ResponseTemplate::new(200).set_body_string("1.1.1.1:80\n2.2.2.2:80\n"))
            .mount(&server)
            .await;

        let source =
            HttpProxySource::new(format!("{}/proxies", server.uri()), Duration::from_secs(5))
                .unwrap();
        let candidates = source.fetch_candidates().await.unwrap();
        assert_eq!(sorted(candidates), vec!["1.1.1.1:80", "2.2.2.2:80"]);
    }

    #[tokio::test]
    async fn test_fetch_empty_list_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\n   \n"))
            .mount(&server)
            .await;

        let source = HttpProxySource::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = source.fetch_candidates().await.unwrap_err();
        assert!(matches!(err, SourceError::EmptyList), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_fetch_error_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = HttpProxySource::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = source.fetch_candidates().await.unwrap_err();
        assert!(matches!(err, SourceError::Http(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_fetch_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "9.9.9.9:9000\n8.8.8.8:8000\n").unwrap();

        let source =
            HttpProxySource::new(file.path().display().to_string(), Duration::from_secs(1))
                .unwrap();
        let candidates = source.fetch_candidates().await.unwrap();
        assert_eq!(sorted(candidates), vec!["8.8.8.8:8000", "9.9.9.9:9000"]);
    }

    #[tokio::test]
    async fn test_fetch_missing_file() {
        let source =
            HttpProxySource::new("/nonexistent/proxyrelay/list.txt", Duration::from_secs(1))
                .unwrap();
        let err = source.fetch_candidates().await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }), "got {:?}", err);
    }
}
