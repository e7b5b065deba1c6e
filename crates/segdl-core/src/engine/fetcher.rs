//! HTTP fetcher - one request with manually followed redirects
//!
//! The client never follows redirects by itself and never keeps idle
//! connections, so every hop opens exactly one connection which is closed
//! as soon as its response is dropped.

use crate::engine::signal::StopSignal;
use crate::error::SegdlError;
use reqwest::header::{HeaderMap, HeaderValue, LOCATION, REFERER};
use reqwest::{redirect, tls, Client, Response};
use segdl_types::Settings;
use std::fmt;
use tracing::debug;
use url::Url;

/// Maximum number of redirects followed for one request
pub const MAX_REDIRECTS: usize = 5;

/// A request to fetch
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    /// Headers sent on every hop
    pub headers: HeaderMap,
    pub referer: Option<String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// A redirect that was followed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moved {
    pub url: Url,
    pub permanent: bool,
}

/// The final, non-redirect response of a fetch
#[derive(Debug)]
pub struct FetchResponse {
    pub response: Response,
    pub final_url: Url,
    /// Redirects in the order they were followed
    pub moves: Vec<Moved>,
}

impl FetchResponse {
    pub fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    pub fn message(&self) -> String {
        let status = self.response.status();
        format!(
            "HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .trim_end()
        .to_string()
    }

    /// The last permanent redirect target, if any
    pub fn permanent_url(&self) -> Option<&Url> {
        self.moves.iter().rev().find(|m| m.permanent).map(|m| &m.url)
    }

    pub fn header(&self, name: impl reqwest::header::AsHeaderName) -> Option<&str> {
        self.response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
    }
}

/// Why a fetch produced no response
#[derive(Debug)]
pub enum FetchError {
    MalformedUrl(String),
    TooManyRedirects,
    /// Connection or transport failure
    Io(reqwest::Error),
    /// The stop signal fired while waiting
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::MalformedUrl(url) => write!(f, "Malformed URL: {}", url),
            FetchError::TooManyRedirects => write!(f, "Too many redirects"),
            FetchError::Io(e) => write!(f, "Request failed: {}", e),
            FetchError::Cancelled => write!(f, "Request cancelled"),
        }
    }
}

/// Performs requests for coordinators and piece workers
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build the shared client from settings
    pub fn new(settings: &Settings) -> Result<Self, SegdlError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .redirect(redirect::Policy::none())
            .connect_timeout(settings.connect_timeout())
            .read_timeout(settings.read_timeout())
            .min_tls_version(tls::Version::TLS_1_2)
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self { client })
    }

    /// Send a GET for `request`, following up to [`MAX_REDIRECTS`] redirects.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        signal: &StopSignal,
    ) -> Result<FetchResponse, FetchError> {
        let mut url = Url::parse(&request.url)
            .map_err(|_| FetchError::MalformedUrl(request.url.clone()))?;
        let mut moves = Vec::new();

        loop {
            let mut builder = self.client.get(url.clone()).headers(request.headers.clone());
            if let Some(referer) = request
                .referer
                .as_deref()
                .and_then(|r| HeaderValue::from_str(r).ok())
            {
                builder = builder.header(REFERER, referer);
            }

            let response = tokio::select! {
                biased;
                _ = signal.stopped() => return Err(FetchError::Cancelled),
                result = builder.send() => result.map_err(FetchError::Io)?,
            };

            let code = response.status().as_u16();
            if !matches!(code, 301 | 302 | 303 | 307) {
                return Ok(FetchResponse {
                    response,
                    final_url: url,
                    moves,
                });
            }

            // A redirect without a usable Location is handed back as-is
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                return Ok(FetchResponse {
                    response,
                    final_url: url,
                    moves,
                });
            };
            drop(response);

            if moves.len() >= MAX_REDIRECTS {
                return Err(FetchError::TooManyRedirects);
            }

            let next = url
                .join(&location)
                .map_err(|_| FetchError::MalformedUrl(location.clone()))?;
            debug!("Following {} redirect: {} -> {}", code, url, next);
            moves.push(Moved {
                url: next.clone(),
                permanent: code == 301,
            });
            url = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&Settings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_follows_redirect_chain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/tmp"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tmp"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/file"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let request = FetchRequest::new(format!("{}/old", server.uri()));
        let response = fetcher().fetch(&request, &StopSignal::new()).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.final_url.path(), "/file");
        assert_eq!(response.moves.len(), 2);
        assert!(response.moves[0].permanent);
        assert!(!response.moves[1].permanent);
        assert_eq!(response.permanent_url().unwrap().path(), "/tmp");
    }

    #[tokio::test]
    async fn test_too_many_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(307).insert_header("Location", "/loop"))
            .expect(MAX_REDIRECTS as u64 + 1)
            .mount(&server)
            .await;

        let request = FetchRequest::new(format!("{}/loop", server.uri()));
        let result = fetcher().fetch(&request, &StopSignal::new()).await;
        assert!(matches!(result, Err(FetchError::TooManyRedirects)));
    }

    #[tokio::test]
    async fn test_headers_and_referer_sent_on_every_hop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .and(header("X-Token", "t1"))
            .and(header("Referer", "http://ref.example/"))
            .respond_with(ResponseTemplate::new(303).insert_header("Location", "/b"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .and(header("X-Token", "t1"))
            .and(header("Referer", "http://ref.example/"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut request = FetchRequest::new(format!("{}/a", server.uri()));
        request.headers.insert("X-Token", HeaderValue::from_static("t1"));
        request.referer = Some("http://ref.example/".to_string());

        let response = fetcher().fetch(&request, &StopSignal::new()).await.unwrap();
        assert_eq!(response.status(), 204);
    }

    #[tokio::test]
    async fn test_malformed_url() {
        let request = FetchRequest::new("not a url");
        let result = fetcher().fetch(&request, &StopSignal::new()).await;
        assert!(matches!(result, Err(FetchError::MalformedUrl(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_response() {
        let signal = StopSignal::new();
        signal.stop(crate::engine::StopReason::Stopped);

        let request = FetchRequest::new("http://127.0.0.1:9/never");
        let result = fetcher().fetch(&request, &signal).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
