use std::error::Error as _;
use std::io::{ErrorKind, Read};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use url::Url;

use super::{parse_estimation_response, AgeEstimator, EstimateError, EstimationResult};
use crate::frame::{CapturedFrame, FRAME_CONTENT_TYPE};

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
const UPLOAD_FIELD: &str = "file";
const UPLOAD_FILENAME: &str = "capture.jpg";

/// Request body layout expected by the estimation endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestFormat {
    /// `multipart/form-data` with the JPEG under field `file`.
    #[default]
    Multipart,
    /// `{"image": "<base64 jpeg>"}`.
    Json,
}

impl RequestFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "multipart" | "form" => Ok(RequestFormat::Multipart),
            "json" | "base64" => Ok(RequestFormat::Json),
            other => Err(anyhow!(
                "unknown estimator format '{}'; expected multipart or json",
                other
            )),
        }
    }
}

/// Age estimation over HTTP.
pub struct HttpAgeEstimator {
    url: String,
    format: RequestFormat,
    client: Client,
}

impl HttpAgeEstimator {
    pub fn new(url: &str, format: RequestFormat, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(url).context("parse estimator url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported estimator scheme '{}'; expected http(s)",
                parsed.scheme()
            ));
        }
        if timeout.is_zero() {
            return Err(anyhow!("estimator timeout must be greater than zero"));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build estimator http client")?;
        Ok(Self {
            url: url.to_string(),
            format,
            client,
        })
    }

    fn send(&self, frame: &CapturedFrame) -> Result<Response, EstimateError> {
        let request = self.client.post(&self.url);
        let request = match self.format {
            RequestFormat::Multipart => {
                let part = Part::bytes(frame.as_jpeg().to_vec())
                    .file_name(UPLOAD_FILENAME)
                    .mime_str(FRAME_CONTENT_TYPE)
                    .map_err(|err| EstimateError::Transport(format!("build upload: {err}")))?;
                request.multipart(Form::new().part(UPLOAD_FIELD, part))
            }
            RequestFormat::Json => request.json(&serde_json::json!({
                "image": base64::engine::general_purpose::STANDARD.encode(frame.as_jpeg()),
            })),
        };
        let response = request.send().map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(EstimateError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

impl AgeEstimator for HttpAgeEstimator {
    fn name(&self) -> &str {
        "http"
    }

    fn estimate(&self, frame: &CapturedFrame) -> Result<EstimationResult, EstimateError> {
        log::info!(
            "HttpAgeEstimator: sending frame {} ({} bytes) to {}",
            frame.fingerprint(),
            frame.byte_len(),
            self.url
        );
        let response = self.send(frame)?;

        let mut raw = String::new();
        response
            .take(MAX_RESPONSE_BYTES as u64 + 1)
            .read_to_string(&mut raw)
            .map_err(|err| {
                if is_timeout(&err) {
                    EstimateError::Timeout
                } else {
                    EstimateError::Transport(format!("read response: {err}"))
                }
            })?;
        if raw.len() > MAX_RESPONSE_BYTES {
            return Err(EstimateError::Malformed("response too large".to_string()));
        }

        let body: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| EstimateError::Malformed(format!("invalid json: {err}")))?;
        parse_estimation_response(&body)
    }
}

fn classify(err: reqwest::Error) -> EstimateError {
    if err.is_timeout() || is_timeout(&err) {
        EstimateError::Timeout
    } else if let Some(status) = err.status() {
        EstimateError::Status(status.as_u16())
    } else {
        EstimateError::Transport(err.to_string())
    }
}

/// True if any error in the chain is an I/O timeout.
fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) {
                return true;
            }
        }
        if let Some(http) = err.downcast_ref::<reqwest::Error>() {
            if http.is_timeout() {
                return true;
            }
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn frame() -> CapturedFrame {
        let pixels = vec![128u8; 8 * 8 * 3];
        CapturedFrame::encode_rgb(&pixels, 8, 8).unwrap()
    }

    /// One-shot HTTP server answering `status` + `body`; returns the request it saw.
    fn serve_once(status: u16, body: &'static str) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = Vec::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                head.extend_from_slice(line.as_bytes());
                if line == "\r\n" {
                    break;
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();
            head.extend_from_slice(&request_body);

            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            )
            .unwrap();
            head
        });
        (format!("http://{addr}/predict-age/"), join)
    }

    #[test]
    fn multipart_upload_parses_predicted_age() {
        let (url, server) = serve_once(200, r#"{"predicted_age": 29}"#);
        let estimator =
            HttpAgeEstimator::new(&url, RequestFormat::Multipart, Duration::from_secs(5)).unwrap();

        let result = estimator.estimate(&frame()).unwrap();
        assert_eq!(result.estimated_age, 29);

        let request = String::from_utf8_lossy(&server.join().unwrap()).to_string();
        assert!(request.starts_with("POST /predict-age/"));
        assert!(request.contains("multipart/form-data; boundary="));
        assert!(request.contains("name=\"file\"; filename=\"capture.jpg\""));
        assert!(request.to_ascii_lowercase().contains("content-type: image/jpeg"));
        assert!(!request.contains("----age-gate-"));
    }

    #[test]
    fn json_upload_sends_base64_image() {
        let (url, server) = serve_once(200, r#"{"faces": [{"age": 16}], "count": 1}"#);
        let estimator =
            HttpAgeEstimator::new(&url, RequestFormat::Json, Duration::from_secs(5)).unwrap();

        assert_eq!(estimator.estimate(&frame()).unwrap().estimated_age, 16);

        let request = String::from_utf8_lossy(&server.join().unwrap()).to_string();
        assert!(request.contains("application/json"));
        assert!(request.contains("\"image\":\"/9j/"));
    }

    #[test]
    fn non_success_status_is_reported() {
        let (url, server) = serve_once(500, r#"{"error": "boom"}"#);
        let estimator =
            HttpAgeEstimator::new(&url, RequestFormat::Multipart, Duration::from_secs(5)).unwrap();
        assert_eq!(
            estimator.estimate(&frame()).unwrap_err(),
            EstimateError::Status(500)
        );
        server.join().unwrap();
    }

    #[test]
    fn malformed_body_is_reported() {
        let (url, server) = serve_once(200, "not json");
        let estimator =
            HttpAgeEstimator::new(&url, RequestFormat::Multipart, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            estimator.estimate(&frame()).unwrap_err(),
            EstimateError::Malformed(_)
        ));
        server.join().unwrap();
    }

    #[test]
    fn unreachable_service_is_transport_error() {
        let estimator = HttpAgeEstimator::new(
            "http://127.0.0.1:9/predict-age/",
            RequestFormat::Multipart,
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(
            estimator.estimate(&frame()).unwrap_err(),
            EstimateError::Transport(_)
        ));
    }

    #[test]
    fn rejects_bad_construction() {
        assert!(HttpAgeEstimator::new("ftp://x", RequestFormat::Json, Duration::from_secs(1)).is_err());
        assert!(
            HttpAgeEstimator::new("http://x", RequestFormat::Json, Duration::ZERO).is_err()
        );
        assert_eq!(RequestFormat::parse("JSON").unwrap(), RequestFormat::Json);
        assert!(RequestFormat::parse("xml").is_err());
    }
}
