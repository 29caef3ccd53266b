use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tallyslip_core::{OcrApi, OcrConfig, Secret};

use crate::recognizer::{OcrBackend, OcrError};

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const IMAGE_ANALYSIS_PATH: &str = "computervision/imageanalysis:analyze";
const IMAGE_ANALYSIS_API_VERSION: &str = "2023-10-01";
const READ_V3_PATH: &str = "vision/v3.2/read/analyze";

// ── Wire types ───────────────────────────────────────────────────────────────

/// Image Analysis 4.0 response; only the `read` feature is requested.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageAnalysisResponse {
    read_result: Option<ReadResult>,
}

#[derive(Debug, Deserialize)]
struct ReadResult {
    #[serde(default)]
    blocks: Vec<TextBlock>,
}

/// A block (4.0) or a page (3.2). Coordinates are ignored.
#[derive(Debug, Deserialize)]
struct TextBlock {
    #[serde(default)]
    lines: Vec<TextLine>,
}

#[derive(Debug, Deserialize)]
struct TextLine {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadOperation {
    status: ReadStatus,
    analyze_result: Option<AnalyzeResult>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
enum ReadStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    #[serde(default)]
    read_results: Vec<TextBlock>,
}

/// Flatten blocks into text: block order, then line order, every line
/// terminated by `\n`.
fn linearize(blocks: &[TextBlock]) -> String {
    blocks
        .iter()
        .flat_map(|b| b.lines.iter())
        .fold(String::new(), |mut out, line| {
            out.push_str(&line.text);
            out.push('\n');
            out
        })
}

// ── Recognizer ───────────────────────────────────────────────────────────────

/// OCR through Azure AI Vision.
pub struct AzureVisionRecognizer {
    client: Client,
    endpoint: String,
    key: Option<Secret>,
    api: OcrApi,
    poll_interval: Duration,
    max_polls: u32,
}

impl AzureVisionRecognizer {
    pub fn new(endpoint: impl Into<String>, key: Option<Secret>) -> Self {
        let defaults = OcrConfig::default();
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            key,
            api: defaults.api,
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
            max_polls: defaults.max_polls,
        }
    }

    pub fn from_config(config: &OcrConfig) -> Self {
        Self::new(config.endpoint.clone(), config.key.clone())
            .with_api(config.api)
            .with_polling(Duration::from_millis(config.poll_interval_ms), config.max_polls)
    }

    pub fn with_api(mut self, api: OcrApi) -> Self {
        self.api = api;
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn credentials(&self) -> Result<(&str, &str), OcrError> {
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(OcrError::MissingCredentials("OCR endpoint"));
        }
        let key = match &self.key {
            Some(key) if !key.is_blank() => key.expose(),
            _ => return Err(OcrError::MissingCredentials("OCR key")),
        };
        Ok((endpoint, key))
    }

    async fn analyze_image(&self, endpoint: &str, key: &str, bytes: &[u8]) -> Result<String, OcrError> {
        let response = self
            .client
            .post(format!("{endpoint}/{IMAGE_ANALYSIS_PATH}"))
            .query(&[("api-version", IMAGE_ANALYSIS_API_VERSION), ("features", "read")])
            .header(SUBSCRIPTION_KEY_HEADER, key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?;

        let parsed: ImageAnalysisResponse = read_json(check_status(response).await?).await?;
        Ok(parsed.read_result.map(|r| linearize(&r.blocks)).unwrap_or_default())
    }

    async fn read_v3(&self, endpoint: &str, key: &str, bytes: &[u8]) -> Result<String, OcrError> {
        let response = self
            .client
            .post(format!("{endpoint}/{READ_V3_PATH}"))
            .header(SUBSCRIPTION_KEY_HEADER, key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?;
        let response = check_status(response).await?;

        let operation = response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| OcrError::InvalidResponse("missing Operation-Location header".into()))?;

        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .client
                .get(&operation)
                .header(SUBSCRIPTION_KEY_HEADER, key)
                .send()
                .await?;
            let op: ReadOperation = read_json(check_status(response).await?).await?;
            tracing::debug!(attempt, status = ?op.status, "Polled OCR read operation");

            match op.status {
                ReadStatus::Succeeded => {
                    return Ok(op
                        .analyze_result
                        .map(|r| linearize(&r.read_results))
                        .unwrap_or_default());
                }
                ReadStatus::Failed => return Err(OcrError::AnalysisFailed),
                ReadStatus::NotStarted | ReadStatus::Running => {}
            }
        }

        Err(OcrError::Timeout { attempts: self.max_polls })
    }
}

#[async_trait]
impl OcrBackend for AzureVisionRecognizer {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<String, OcrError> {
        let (endpoint, key) = self.credentials()?;
        tracing::debug!(bytes = image_bytes.len(), api = ?self.api, "Sending image to Azure Vision");

        let text = match self.api {
            OcrApi::ImageAnalysis => self.analyze_image(endpoint, key, image_bytes).await?,
            OcrApi::ReadV3 => self.read_v3(endpoint, key, image_bytes).await?,
        };

        if text.is_empty() {
            tracing::warn!("OCR service found no readable text");
        }
        Ok(text)
    }
}

async fn check_status(response: Response) -> Result<Response, OcrError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(OcrError::Status { status: status.as_u16(), body })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, OcrError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| OcrError::InvalidResponse(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        uri: Uri,
        key: Option<String>,
        content_type: Option<String>,
        body_len: usize,
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
    }

    /// Server answering every request with `reply(n)` where `n` counts requests.
    async fn recording_server<F>(reply: F) -> (String, Arc<Mutex<Vec<Seen>>>)
    where
        F: Fn(usize, &HeaderMap) -> AxumResponse + Clone + Send + Sync + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let app = Router::new().fallback(
            move |method: axum::http::Method, uri: Uri, headers: HeaderMap, body: Bytes| {
                let log = Arc::clone(&log);
                let reply = reply.clone();
                async move {
                    let n = {
                        let mut log = log.lock().unwrap();
                        log.push(Seen {
                            method: method.to_string(),
                            uri,
                            key: header(&headers, SUBSCRIPTION_KEY_HEADER),
                            content_type: header(&headers, "content-type"),
                            body_len: body.len(),
                        });
                        log.len()
                    };
                    reply(n, &headers)
                }
            },
        );
        (serve(app).await, seen)
    }

    fn block(lines: &[&str]) -> TextBlock {
        TextBlock { lines: lines.iter().map(|t| TextLine { text: t.to_string() }).collect() }
    }

    #[test]
    fn linearize_orders_blocks_then_lines() {
        let text = linearize(&[block(&["STARBUCKS", "123 Main St"]), block(&["Latte 5.25"])]);
        assert_eq!(text, "STARBUCKS\n123 Main St\nLatte 5.25\n");
    }

    #[test]
    fn zero_blocks_yield_empty_string() {
        assert_eq!(linearize(&[]), "");
        let parsed: ImageAnalysisResponse =
            serde_json::from_value(json!({ "readResult": { "blocks": [] } })).unwrap();
        assert_eq!(parsed.read_result.map(|r| linearize(&r.blocks)).unwrap(), "");
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let (base, seen) = recording_server(|_, _| StatusCode::OK.into_response()).await;
        let ocr = AzureVisionRecognizer::new(base, None);
        let err = ocr.recognize(b"img").await.unwrap_err();
        assert!(matches!(err, OcrError::MissingCredentials("OCR key")));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_endpoint_fails_before_any_request() {
        let ocr = AzureVisionRecognizer::new("  ", Some(Secret::new("k")));
        let err = ocr.recognize(b"img").await.unwrap_err();
        assert!(matches!(err, OcrError::MissingCredentials("OCR endpoint")));
    }

    #[tokio::test]
    async fn image_analysis_returns_linearized_text() {
        let (base, seen) = recording_server(|_, _| {
            Json(json!({
                "modelVersion": "2023-10-01",
                "readResult": { "blocks": [
                    { "lines": [
                        { "text": "WHOLE FOODS", "boundingPolygon": [], "words": [] },
                        { "text": "2024-03-15", "boundingPolygon": [], "words": [] }
                    ]},
                    { "lines": [ { "text": "TOTAL 87.50", "boundingPolygon": [], "words": [] } ] }
                ]}
            }))
            .into_response()
        })
        .await;

        let ocr = AzureVisionRecognizer::new(format!("{base}/"), Some(Secret::new("secret-key")));
        let text = ocr.recognize(b"jpeg bytes").await.unwrap();
        assert_eq!(text, "WHOLE FOODS\n2024-03-15\nTOTAL 87.50\n");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let req = &seen[0];
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri.path(), "/computervision/imageanalysis:analyze");
        let query = req.uri.query().unwrap();
        assert!(query.contains("api-version=2023-10-01"));
        assert!(query.contains("features=read"));
        assert_eq!(req.key.as_deref(), Some("secret-key"));
        assert_eq!(req.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(req.body_len, 10);
    }

    #[tokio::test]
    async fn no_read_result_is_empty_text() {
        let (base, _) = recording_server(|_, _| Json(json!({ "modelVersion": "x" })).into_response()).await;
        let ocr = AzureVisionRecognizer::new(base, Some(Secret::new("k")));
        assert_eq!(ocr.recognize(b"img").await.unwrap(), "");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (base, _) = recording_server(|_, _| {
            (StatusCode::UNAUTHORIZED, "Access denied due to invalid subscription key").into_response()
        })
        .await;
        let ocr = AzureVisionRecognizer::new(base, Some(Secret::new("bad")));
        match ocr.recognize(b"img").await.unwrap_err() {
            OcrError::Status { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("invalid subscription key"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_response() {
        let (base, _) = recording_server(|_, _| "<html>oops</html>".into_response()).await;
        let ocr = AzureVisionRecognizer::new(base, Some(Secret::new("k")));
        assert!(matches!(ocr.recognize(b"img").await, Err(OcrError::InvalidResponse(_))));
    }

    fn read_v3_reply(statuses: Vec<&'static str>) -> impl Fn(usize, &HeaderMap) -> AxumResponse + Clone {
        let statuses = Arc::new(statuses);
        move |n: usize, headers: &HeaderMap| {
            if n == 1 {
                let host = header(headers, "host").unwrap_or_default();
                return (
                    StatusCode::ACCEPTED,
                    [("Operation-Location", format!("http://{host}/vision/v3.2/read/analyzeResults/op-1"))],
                )
                    .into_response();
            }
            let status = statuses[(n - 2).min(statuses.len() - 1)];
            Json(json!({
                "status": status,
                "analyzeResult": { "readResults": [
                    { "page": 1, "lines": [ { "text": "SHELL" }, { "text": "FUEL 40.00" } ] },
                    { "page": 2, "lines": [ { "text": "THANK YOU" } ] }
                ]}
            }))
            .into_response()
        }
    }

    fn read_v3(base: String, max_polls: u32) -> AzureVisionRecognizer {
        AzureVisionRecognizer::new(base, Some(Secret::new("k")))
            .with_api(OcrApi::ReadV3)
            .with_polling(Duration::from_millis(5), max_polls)
    }

    #[tokio::test]
    async fn read_v3_polls_until_succeeded() {
        let (base, seen) = recording_server(read_v3_reply(vec!["notStarted", "running", "succeeded"])).await;
        let text = read_v3(base, 10).recognize(b"img").await.unwrap();
        assert_eq!(text, "SHELL\nFUEL 40.00\nTHANK YOU\n");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].uri.path(), "/vision/v3.2/read/analyze");
        assert!(seen[1..].iter().all(|s| s.method == "GET" && s.key.as_deref() == Some("k")));
    }

    #[tokio::test]
    async fn read_v3_failed_status_is_an_error() {
        let (base, _) = recording_server(read_v3_reply(vec!["failed"])).await;
        assert!(matches!(read_v3(base, 10).recognize(b"img").await, Err(OcrError::AnalysisFailed)));
    }

    #[tokio::test]
    async fn read_v3_gives_up_after_max_polls() {
        let (base, seen) = recording_server(read_v3_reply(vec!["running"])).await;
        let err = read_v3(base, 3).recognize(b"img").await.unwrap_err();
        assert!(matches!(err, OcrError::Timeout { attempts: 3 }));
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn read_v3_without_operation_location_is_invalid() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let (base, _) = recording_server(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            StatusCode::ACCEPTED.into_response()
        })
        .await;
        let err = read_v3(base, 3).recognize(b"img").await.unwrap_err();
        assert!(matches!(err, OcrError::InvalidResponse(_)));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }
}
