//! Executes tunnelled `request` messages against their target origin and
//! streams the outcome back as `response` messages.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{Headers, HttpRequestEnvelope, HttpResponseEnvelope, Topic};
use crate::session::Session;

const MAX_REDIRECTS: usize = 10;
const TRANSPORT_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Headers never forwarded to the origin; reqwest manages these itself and
/// `Accept-Encoding` is pinned so the tunnel always carries plaintext bodies.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "transfer-encoding",
    "content-length",
    "accept-encoding",
];

pub struct RequestExecutor {
    client: reqwest::Client,
    allow_list: Vec<String>,
}

impl RequestExecutor {
    /// Build the outbound HTTP client from configuration: capped redirects,
    /// request timeout, optional extra CA root, optional verification skip.
    /// Gzip responses are decoded before entering the tunnel.
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(config.request_timeout)
            .gzip(true);

        if let Some(ca_file) = &config.request_ca_file {
            let pem = std::fs::read(ca_file)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if config.insecure_skip_verify {
            warn!("outbound TLS verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(RequestExecutor {
            client: builder.build()?,
            allow_list: config.white_list.clone(),
        })
    }

    /// Serve `request` messages from the session until it closes. Each
    /// message runs on its own task so a slow origin cannot stall the rest
    /// of the tunnel.
    pub async fn run(self: Arc<Self>, session: Session) {
        let mut requests = session.subscribe(Topic::Request);
        while let Some(message) = requests.recv().await {
            let executor = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let response = match serde_json::from_slice::<HttpRequestEnvelope>(&message.payload)
                {
                    Ok(request) => executor.execute(request).await,
                    Err(err) => {
                        warn!(id = %message.id, error = %err, "malformed request envelope");
                        HttpResponseEnvelope::error(500, format!("malformed request: {err}"))
                    }
                };
                let payload = match response.to_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(id = %message.id, error = %err, "failed to encode response");
                        return;
                    }
                };
                if let Err(err) = session
                    .send_with_id(&message.id, Topic::Response, &payload)
                    .await
                {
                    warn!(id = %message.id, error = %err, "failed to send response");
                }
            });
        }
        debug!("request subscription ended, executor stopping");
    }

    /// Perform one request. Never fails: policy rejections become 403 and
    /// transport failures become 500, both with a JSON error body.
    pub async fn execute(&self, request: HttpRequestEnvelope) -> HttpResponseEnvelope {
        let host = match Url::parse(&request.url) {
            Ok(url) => url.host_str().unwrap_or_default().to_string(),
            Err(err) => {
                return HttpResponseEnvelope::error(500, format!("invalid target url: {err}"))
            }
        };
        if !self.host_allowed(&host) {
            info!(host, "target host rejected by allow-list");
            return HttpResponseEnvelope::error(403, "target host not allowed");
        }

        let mut attempt = 0;
        let outcome = loop {
            match self.perform(&request).await {
                Ok(response) => break Ok(response),
                // Transport failures retry; HTTP-level statuses never do.
                Err(err) if attempt < TRANSPORT_RETRIES => {
                    attempt += 1;
                    warn!(
                        url = %request.url,
                        attempt,
                        error = %err,
                        "outbound request failed, retrying"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok(response) => {
                info!(
                    method = %request.method,
                    url = %request.url,
                    status = response.status_code,
                    "request executed"
                );
                response
            }
            Err(err) => {
                warn!(method = %request.method, url = %request.url, error = %err, "request failed");
                HttpResponseEnvelope::error(500, err.to_string())
            }
        }
    }

    /// Empty list allows everything; otherwise the target host must start
    /// with one of the entries.
    fn host_allowed(&self, host: &str) -> bool {
        self.allow_list.is_empty() || self.allow_list.iter().any(|entry| host.starts_with(entry))
    }

    async fn perform(
        &self,
        request: &HttpRequestEnvelope,
    ) -> std::result::Result<HttpResponseEnvelope, reqwest::Error> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut builder = self
            .client
            .request(method, request.url.as_str())
            .headers(build_header_map(&request.headers));
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status_code = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponseEnvelope {
            status_code,
            headers,
            body,
        })
    }
}

/// Envelope headers → reqwest header map, skipping transport-managed names
/// and values that are not valid header material.
fn build_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        if SKIPPED_REQUEST_HEADERS
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                map.append(header_name.clone(), header_value);
            }
        }
    }
    map
}

/// Response header map → multi-valued envelope headers; non-UTF-8 values
/// cannot travel in JSON and are skipped.
fn flatten_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}
