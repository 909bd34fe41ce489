/// HTTP plumbing: client construction, the length probe, and range requests.
use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use tracing::debug;

use rangefetch_shared::{Chunk, DownloadError, DownloadResult};

/// Build a client whose timeout covers each whole request, body included.
pub fn build_client(timeout_secs: u64, no_proxy: bool) -> DownloadResult<Client> {
    let mut builder = Client::builder().timeout(Duration::from_secs(timeout_secs));
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|e| DownloadError::RequestFailure(format!("failed to build HTTP client: {}", e)))
}

pub fn parse_url(raw: &str) -> DownloadResult<Url> {
    Url::parse(raw).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", raw, e)))
}

/// GET with the caller's headers plus our own `Range`.
///
/// A caller-supplied `Range` is dropped so the request never carries two.
fn ranged_get(
    client: &Client,
    url: Url,
    headers: &HashMap<String, String>,
    range: String,
) -> RequestBuilder {
    let mut request = client.get(url);
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(RANGE.as_str()) {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }
    request.header(RANGE, range)
}

/// Ask the server for the full length with `Range: bytes=0-`.
///
/// Only headers are read; the body is dropped unread.
pub async fn probe_length(
    client: &Client,
    url: Url,
    headers: &HashMap<String, String>,
) -> DownloadResult<u64> {
    let response = ranged_get(client, url, headers, "bytes=0-".to_string())
        .send()
        .await
        .map_err(|e| DownloadError::RequestFailure(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::RequestFailure(format!(
            "length probe returned {}",
            status
        )));
    }

    let raw = response
        .headers()
        .get(CONTENT_LENGTH)
        .ok_or_else(|| DownloadError::InvalidLength("missing Content-Length".into()))?
        .to_str()
        .map_err(|e| DownloadError::InvalidLength(e.to_string()))?;
    let length: i64 = raw
        .trim()
        .parse()
        .map_err(|_| DownloadError::InvalidLength(format!("not a number: {:?}", raw)))?;
    if length <= 0 {
        return Err(DownloadError::InvalidLength(format!("{} bytes", length)));
    }

    debug!("Probe reported {} bytes (status {})", length, status);
    Ok(length as u64)
}

/// Request the missing part of `chunk`.
///
/// A plain 200 is only usable when the range starts at byte 0, since the
/// body then begins exactly where the chunk does.
pub async fn fetch_range(
    client: &Client,
    url: Url,
    headers: &HashMap<String, String>,
    chunk: &Chunk,
) -> DownloadResult<Response> {
    let range = chunk.range_header();
    let response = ranged_get(client, url, headers, range.clone())
        .send()
        .await
        .map_err(|e| DownloadError::RequestFailure(e.to_string()))?;

    check_range_status(response.status(), chunk.current, &range)?;
    Ok(response)
}

fn check_range_status(status: StatusCode, offset: u64, range: &str) -> DownloadResult<()> {
    if status == StatusCode::PARTIAL_CONTENT || (status.is_success() && offset == 0) {
        return Ok(());
    }
    Err(DownloadError::RequestFailure(format!(
        "unexpected status {} for {}",
        status, range
    )))
}
