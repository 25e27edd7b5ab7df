use bytes::Bytes;

use crate::upstream::HttpMethod;

/// Inferred semantic type of an inbound LLM request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Chat,
    Completion,
    Embedding,
    ImageGeneration,
    Transcription,
    Translation,
    AssistantControl,
    Other,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Chat => "chat",
            CallKind::Completion => "completion",
            CallKind::Embedding => "embedding",
            CallKind::ImageGeneration => "image_generation",
            CallKind::Transcription => "transcription",
            CallKind::Translation => "translation",
            CallKind::AssistantControl => "assistant_control",
            CallKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Buffered,
    Streaming,
}

/// One classified inbound request. Built once by the classifier and carried
/// through the whole pipeline; only `consumer_id` is filled in later (by the
/// auth step).
///
/// `raw_body` is the byte-exact inbound body. Model-rewritten bodies are
/// derived from it per dispatch attempt and never written back, so retries
/// within one request always start from the same bytes.
#[derive(Debug, Clone)]
pub struct CallDetails {
    pub call_kind: CallKind,
    pub method: HttpMethod,
    pub incoming_model_name: Option<String>,
    pub deployment_name: Option<String>,
    pub assistant_id: Option<String>,
    pub prompt_text: Option<String>,
    pub response_shape: ResponseShape,
    pub remaining_path: String,
    pub raw_body: Bytes,
    pub consumer_id: Option<String>,
    pub preferred_endpoint_id: Option<String>,
}

impl CallDetails {
    pub fn is_streaming(&self) -> bool {
        self.response_shape == ResponseShape::Streaming
    }

    /// The model name the request arrived with, falling back to the URL
    /// deployment segment for Azure-shaped paths.
    pub fn model_or_deployment(&self) -> Option<&str> {
        self.incoming_model_name
            .as_deref()
            .or(self.deployment_name.as_deref())
    }

    /// Prompt size estimate used for token-rate admission. One token per
    /// four UTF-8 bytes, rounded up; budgeting-grade, not exact.
    pub fn estimated_prompt_tokens(&self) -> u64 {
        match self.prompt_text.as_deref() {
            Some(text) if !text.is_empty() => (text.len() as u64).div_ceil(4),
            _ => 0,
        }
    }
}
