use async_trait::async_trait;
use serde_json::json;

use crate::{GenerationRequest, GenerationResponse, StoryModel, Usage};
use fabula_types::{FabulaError, Result};

// ---------------------------------------------------------------------------
// OpenAiBackend
// ---------------------------------------------------------------------------

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Minimal backend for an OpenAI-compatible `/chat/completions` endpoint.
///
/// Requests always ask for a JSON object response; the model's content is
/// fence-stripped and parsed before being handed back.
#[derive(Debug)]
pub struct OpenAiBackend {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Build from `OPENAI_API_KEY`, honouring `OPENAI_BASE_URL` when set.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| FabulaError::Auth {
            message: "OPENAI_API_KEY is not set".into(),
        })?;
        let mut backend = Self::new(key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            backend.base_url = url.trim_end_matches('/').to_string();
        }
        Ok(backend)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "response_format": { "type": "json_object" },
        })
    }

    fn parse_response(&self, body: serde_json::Value) -> Result<GenerationResponse> {
        let model = body["model"].as_str().unwrap_or(&self.model).to_string();

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| FabulaError::MalformedOutput {
                message: "response has no message content".into(),
            })?;

        let stripped = strip_code_fences(content);
        let parsed: serde_json::Value =
            serde_json::from_str(stripped).map_err(|e| FabulaError::MalformedOutput {
                message: format!("content is not valid JSON: {e}"),
            })?;

        let usage = Usage {
            input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        Ok(GenerationResponse {
            json: parsed,
            model,
            usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Content and error helpers
// ---------------------------------------------------------------------------

/// Models occasionally wrap their JSON in a Markdown fence despite the
/// response-format directive. Strip one layer if present.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

fn map_error(status: reqwest::StatusCode, retry_after: Option<u64>, body: &str) -> FabulaError {
    match status.as_u16() {
        429 => FabulaError::RateLimited {
            retry_after_ms: retry_after.unwrap_or(2000),
        },
        401 | 403 => FabulaError::Auth {
            message: extract_error_message(body),
        },
        code => FabulaError::Network {
            message: format!("HTTP {code}: {}", extract_error_message(body)),
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .map(|secs| (secs * 1000.0) as u64)
}

// ---------------------------------------------------------------------------
// StoryModel implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl StoryModel for OpenAiBackend {
    async fn invoke(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let body = self.build_request_body(request);

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| FabulaError::Network {
                message: e.to_string(),
            })?;

        let status = resp.status();
        let retry_after = retry_after_ms(resp.headers());
        let response_body = resp.text().await.map_err(|e| FabulaError::Network {
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(map_error(status, retry_after, &response_body));
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&response_body).map_err(|e| FabulaError::MalformedOutput {
                message: format!("response body is not JSON: {e}"),
            })?;

        self.parse_response(parsed)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskKind;

    fn backend() -> OpenAiBackend {
        OpenAiBackend::new("test-key".into())
    }

    fn sample_body(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-123",
            "model": "gpt-4o-mini",
            "choices": [
                { "index": 0, "message": { "role": "assistant", "content": content } }
            ],
            "usage": { "prompt_tokens": 120, "completion_tokens": 48 }
        })
    }

    #[test]
    fn request_body_has_messages_and_json_format() {
        let request = GenerationRequest::new(TaskKind::World, "you are a designer", "build it");
        let body = backend().build_request_body(&request);

        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "you are a designer");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "build it");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn parse_response_extracts_json_and_usage() {
        let body = sample_body(r#"{"synopsis": "a voyage"}"#);
        let response = backend().parse_response(body).unwrap();

        assert_eq!(response.json["synopsis"], "a voyage");
        assert_eq!(response.model, "gpt-4o-mini");
        assert_eq!(response.usage.input_tokens, 120);
        assert_eq!(response.usage.output_tokens, 48);
    }

    #[test]
    fn parse_response_strips_code_fences() {
        let body = sample_body("```json\n{\"ok\": true}\n```");
        let response = backend().parse_response(body).unwrap();
        assert_eq!(response.json["ok"], true);
    }

    #[test]
    fn parse_response_without_content_is_malformed() {
        let body = json!({ "model": "gpt-4o-mini", "choices": [] });
        let err = backend().parse_response(body).unwrap_err();
        assert!(matches!(err, FabulaError::MalformedOutput { .. }));
    }

    #[test]
    fn parse_response_with_non_json_content_is_malformed() {
        let body = sample_body("Once upon a time...");
        let err = backend().parse_response(body).unwrap_err();
        assert!(matches!(err, FabulaError::MalformedOutput { .. }));
    }

    #[test]
    fn strip_code_fences_variants() {
        assert_eq!(strip_code_fences("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn map_error_429_uses_hint() {
        let err = map_error(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(3500), "{}");
        match err {
            FabulaError::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, 3500),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn map_error_429_defaults_without_hint() {
        let err = map_error(reqwest::StatusCode::TOO_MANY_REQUESTS, None, "{}");
        match err {
            FabulaError::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, 2000),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn map_error_401_is_auth() {
        let body = r#"{"error": {"message": "bad key"}}"#;
        let err = map_error(reqwest::StatusCode::UNAUTHORIZED, None, body);
        match err {
            FabulaError::Auth { message } => assert_eq!(message, "bad key"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn map_error_500_is_network() {
        let err = map_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, None, "boom");
        match err {
            FabulaError::Network { message } => {
                assert!(message.contains("HTTP 500"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn with_base_url_trims_trailing_slash() {
        let b = backend().with_base_url("http://localhost:8080/v1/");
        assert_eq!(b.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn with_model_overrides_default() {
        let b = backend().with_model("gpt-4o");
        assert_eq!(b.model, "gpt-4o");
    }
}
