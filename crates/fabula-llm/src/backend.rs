//! The backend trait all generation calls go through.

use async_trait::async_trait;

use crate::{GenerationRequest, GenerationResponse};
use fabula_types::Result;

/// A remote model capable of serving generation requests.
///
/// Implementations translate a [`GenerationRequest`] onto their wire
/// protocol and fail with `RateLimited`, `Network`, `Auth`, or
/// `MalformedOutput`. Retry policy does not belong here; it lives in
/// [`GenerationClient`](crate::GenerationClient) so every backend gets the
/// same treatment.
#[async_trait]
pub trait StoryModel: Send + Sync {
    async fn invoke(&self, request: &GenerationRequest) -> Result<GenerationResponse>;

    /// Stable backend name for logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TaskKind, Usage};
    use std::sync::Arc;

    struct EchoModel;

    #[async_trait]
    impl StoryModel for EchoModel {
        async fn invoke(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
            Ok(GenerationResponse {
                json: serde_json::json!({ "echo": request.prompt }),
                model: "echo".into(),
                usage: Usage::default(),
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn dispatch_through_trait_object() {
        let model: Arc<dyn StoryModel> = Arc::new(EchoModel);
        let request = GenerationRequest::new(TaskKind::Summary, "sys", "hello");
        let response = model.invoke(&request).await.unwrap();
        assert_eq!(response.json["echo"], "hello");
        assert_eq!(model.name(), "echo");
    }
}
