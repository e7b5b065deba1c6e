//! Metadata discovery - what the server tells us about a resource before
//! any piece is fetched

use crate::engine::fetcher::{FetchError, FetchRequest, FetchResponse, HttpFetcher};
use crate::engine::signal::StopSignal;
use crate::outcome::Outcome;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_LOCATION, CONTENT_RANGE,
    CONTENT_TYPE, ETAG,
};
use segdl_types::{StatusCode, DEFAULT_MIME_TYPE};
use tracing::{debug, info};
use url::Url;

/// Fallback name when neither the server nor the URL suggests one
pub const FALLBACK_FILE_NAME: &str = "download";

/// Facts learned from a probe response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub final_url: Url,
    /// Target of the last permanent redirect, if one was followed
    pub permanent_url: Option<Url>,
    pub total_bytes: Option<u64>,
    pub partial_support: bool,
    pub mime_type: String,
    pub etag: Option<String>,
    pub file_name: String,
    /// Referer the server insisted on, when the probe had to add one
    pub referer: Option<String>,
}

impl Metadata {
    pub fn from_response(response: &FetchResponse) -> Self {
        let content_range = response.header(CONTENT_RANGE);
        let total_bytes = content_range
            .and_then(content_range_total)
            .or_else(|| response.header(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()));

        let partial_support = content_range.is_some()
            || response
                .header(ACCEPT_RANGES)
                .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
                .unwrap_or(false);

        let file_name = response
            .header(CONTENT_DISPOSITION)
            .and_then(file_name_from_disposition)
            .or_else(|| {
                response
                    .header(CONTENT_LOCATION)
                    .and_then(|loc| response.final_url.join(loc).ok())
                    .and_then(|url| file_name_from_url(&url))
            })
            .or_else(|| file_name_from_url(&response.final_url))
            .map(|name| sanitize_file_name(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

        let reported = response
            .header(CONTENT_TYPE)
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        let mime_type = refine_mime_type(reported.as_deref(), &file_name);

        Self {
            final_url: response.final_url.clone(),
            permanent_url: response.permanent_url().cloned(),
            total_bytes,
            partial_support,
            mime_type,
            etag: response.header(ETAG).map(str::to_string),
            file_name,
            referer: None,
        }
    }

    pub fn is_html(&self) -> bool {
        self.mime_type == "text/html" || self.mime_type == "application/xhtml+xml"
    }
}

/// Probe `request`, retrying once with a self-referer when the server
/// answers with an HTML page and no referer was sent.
pub async fn discover(
    fetcher: &HttpFetcher,
    request: &FetchRequest,
    signal: &StopSignal,
) -> Result<Metadata, Outcome> {
    let metadata = probe(fetcher, request, signal).await?;
    if !metadata.is_html() || request.referer.is_some() {
        return Ok(metadata);
    }

    info!("Probe of {} returned HTML, retrying with referer", request.url);
    let mut retry = request.clone();
    retry.referer = Some(request.url.clone());
    let mut metadata = probe(fetcher, &retry, signal).await?;
    metadata.referer = retry.referer;
    Ok(metadata)
}

/// A single metadata request; only the headers of the response are used
pub async fn probe(
    fetcher: &HttpFetcher,
    request: &FetchRequest,
    signal: &StopSignal,
) -> Result<Metadata, Outcome> {
    let response = fetcher
        .fetch(request, signal)
        .await
        .map_err(fetch_error_outcome)?;

    let code = response.status();
    if !(200..300).contains(&code) {
        return Err(Outcome::new(unexpected_status(code), response.message()));
    }

    let metadata = Metadata::from_response(&response);
    debug!(
        "Probe {}: size={:?} ranges={} type={} name={}",
        metadata.final_url,
        metadata.total_bytes,
        metadata.partial_support,
        metadata.mime_type,
        metadata.file_name
    );
    Ok(metadata)
}

/// Map a failed fetch to the outcome of the attempt that issued it
pub fn fetch_error_outcome(error: FetchError) -> Outcome {
    match error {
        FetchError::MalformedUrl(url) => {
            Outcome::new(StatusCode::MalformedUrl, "Malformed URL").with_cause(url)
        }
        FetchError::TooManyRedirects => {
            Outcome::new(StatusCode::TooManyRedirects, "Too many redirects")
        }
        FetchError::Cancelled => Outcome::stopped(),
        FetchError::Io(e) => {
            Outcome::new(StatusCode::HttpDataError, "Connection failed").with_cause(e)
        }
    }
}

/// Status for a response nobody knows how to handle
pub fn unexpected_status(code: u16) -> StatusCode {
    match code {
        300..=399 => StatusCode::UnhandledRedirect,
        400..=599 => StatusCode::Upstream(code),
        _ => StatusCode::UnhandledHttpCode,
    }
}

/// Total length from `Content-Range: bytes 0-99/1234`; `*` means unknown
pub fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// First byte of `Content-Range: bytes 100-199/1234`
pub fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split_once('-')?.0.trim().parse().ok()
}

/// File name from a `Content-Disposition` value, preferring `filename*`
pub fn file_name_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // RFC 5987: charset'lang'percent-encoded
                let encoded = raw.trim().splitn(3, '\'').nth(2).unwrap_or(raw.trim());
                if let Ok(decoded) = urlencoding::decode(encoded.trim_matches('"')) {
                    if !decoded.is_empty() {
                        return Some(decoded.into_owned());
                    }
                }
            }
            "filename" => {
                let name = raw.trim().trim_matches('"');
                if !name.is_empty() {
                    plain = Some(name.to_string());
                }
            }
            _ => {}
        }
    }
    plain
}

/// Last non-empty path segment of `url`, percent-decoded
pub fn file_name_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    Some(decoded)
}

/// Strip anything that could escape the destination directory
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            c if c.is_control() => '_',
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    cleaned.to_string()
}

/// Keep a specific server type, otherwise guess from the extension
pub fn refine_mime_type(reported: Option<&str>, file_name: &str) -> String {
    match reported {
        Some(mime) if mime != DEFAULT_MIME_TYPE => mime.to_string(),
        _ => mime_from_extension(file_name)
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string(),
    }
}

pub fn mime_from_extension(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "bz2" => "application/x-bzip2",
        "xz" => "application/x-xz",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",
        "tar" => "application/x-tar",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "apk" => "application/vnd.android.package-archive",
        "iso" => "application/x-iso9660-image",
        "exe" => "application/vnd.microsoft.portable-executable",
        "deb" => "application/vnd.debian.binary-package",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use segdl_types::Settings;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 0-99/1234"), Some(1234));
        assert_eq!(content_range_total("bytes 0-99/*"), None);
        assert_eq!(content_range_total("garbage"), None);

        assert_eq!(content_range_start("bytes 100-199/1234"), Some(100));
        assert_eq!(content_range_start("bytes 0-99/*"), Some(0));
        assert_eq!(content_range_start("bytes */1234"), None);
    }

    #[test]
    fn test_disposition_prefers_extended_name() {
        assert_eq!(
            file_name_from_disposition("attachment; filename=\"plain.bin\"").as_deref(),
            Some("plain.bin")
        );
        assert_eq!(
            file_name_from_disposition(
                "attachment; filename=\"fallback.txt\"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"
            )
            .as_deref(),
            Some("résumé.pdf")
        );
        assert_eq!(file_name_from_disposition("inline"), None);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("a:b?.txt"), "a_b_.txt");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }

    #[test]
    fn test_mime_refinement() {
        assert_eq!(refine_mime_type(Some(DEFAULT_MIME_TYPE), "x.zip"), "application/zip");
        assert_eq!(refine_mime_type(None, "movie.MKV"), "video/x-matroska");
        assert_eq!(refine_mime_type(Some("text/plain"), "x.zip"), "text/plain");
        assert_eq!(refine_mime_type(None, "noext"), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn test_unexpected_status() {
        assert_eq!(unexpected_status(304), StatusCode::UnhandledRedirect);
        assert_eq!(unexpected_status(404), StatusCode::Upstream(404));
        assert_eq!(unexpected_status(502), StatusCode::Upstream(502));
        assert_eq!(unexpected_status(102), StatusCode::UnhandledHttpCode);
    }

    #[tokio::test]
    async fn test_probe_reads_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/archive"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Content-Type", "application/octet-stream")
                    .insert_header("Content-Disposition", "attachment; filename=\"data.zip\"")
                    .set_body_bytes(vec![0u8; 4001]),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&Settings::default()).unwrap();
        let request = FetchRequest::new(format!("{}/files/archive", server.uri()));
        let metadata = discover(&fetcher, &request, &StopSignal::new()).await.unwrap();

        assert_eq!(metadata.total_bytes, Some(4001));
        assert!(metadata.partial_support);
        assert_eq!(metadata.etag.as_deref(), Some("\"v1\""));
        assert_eq!(metadata.file_name, "data.zip");
        assert_eq!(metadata.mime_type, "application/zip");
        assert!(metadata.permanent_url.is_none());
    }

    #[tokio::test]
    async fn test_html_probe_retried_with_referer() {
        let server = MockServer::start().await;
        let url = format!("{}/get", server.uri());
        Mock::given(method("GET"))
            .and(path("/get"))
            .and(header("Referer", url.as_str()))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/pdf")
                    .set_body_bytes(vec![1u8; 10]),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/get"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html></html>", "text/html; charset=utf-8"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&Settings::default()).unwrap();
        let metadata = discover(&fetcher, &FetchRequest::new(url.clone()), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(metadata.mime_type, "application/pdf");
        assert_eq!(metadata.referer.as_deref(), Some(url.as_str()));

        // A request that already carries a referer is not retried
        let server2 = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("Referer"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "text/html"))
            .expect(1)
            .mount(&server2)
            .await;
        let mut request = FetchRequest::new(format!("{}/page", server2.uri()));
        request.referer = Some("http://elsewhere/".to_string());
        let metadata = discover(&fetcher, &request, &StopSignal::new()).await.unwrap();
        assert!(metadata.is_html());
    }

    #[tokio::test]
    async fn test_probe_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&Settings::default()).unwrap();
        let request = FetchRequest::new(format!("{}/missing", server.uri()));
        let outcome = probe(&fetcher, &request, &StopSignal::new()).await.unwrap_err();
        assert_eq!(outcome.status(), StatusCode::Upstream(404));
    }
}
