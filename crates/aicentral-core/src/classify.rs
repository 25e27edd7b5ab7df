use bytes::Bytes;
use http::{HeaderMap, Method};

use aicentral_endpoint_core::{
    CallDetails, CallKind, GatewayError, HttpMethod, ResponseShape,
};

pub const AFFINITY_REQUEST_HEADER: &str = "x-aicentral-affinity";

/// Parse an inbound request into `CallDetails`.
///
/// Azure-shaped paths (`/openai/deployments/{deployment}/...`) and
/// OpenAI-shaped paths (`/v1/...`) are recognised; anything else classifies
/// as `Other` with its original path kept for forwarding. Malformed JSON on
/// a recognised POST is a 400; the unknown shapes are never rejected here
/// because the dispatcher still proxies them.
pub fn classify_request(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<CallDetails, GatewayError> {
    let method = HttpMethod::parse(method.as_str())
        .ok_or_else(|| GatewayError::method_not_allowed("unsupported method"))?;

    let trimmed = path.trim_start_matches('/');
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();

    let preferred_endpoint_id = header_value(headers, AFFINITY_REQUEST_HEADER);

    let (call_kind, deployment_name, assistant_id, remaining_path) = match segments.as_slice() {
        ["openai", "deployments", deployment, rest @ ..] => {
            let tail = rest.join("/");
            (kind_from_tail(&tail), Some((*deployment).to_string()), None, tail)
        }
        ["openai", "assistants", rest @ ..] => {
            let assistant = rest.first().map(|id| (*id).to_string());
            (
                CallKind::AssistantControl,
                None,
                assistant,
                segments[1..].join("/"),
            )
        }
        ["v1", "assistants", rest @ ..] => {
            let assistant = rest.first().map(|id| (*id).to_string());
            (
                CallKind::AssistantControl,
                None,
                assistant,
                segments[1..].join("/"),
            )
        }
        ["v1", rest @ ..] if !rest.is_empty() => {
            let tail = rest.join("/");
            (kind_from_tail(&tail), None, None, tail)
        }
        _ => (CallKind::Other, None, None, trimmed.to_string()),
    };

    let parsed_body = parse_body(call_kind, method, &body)?;
    let response_shape = match parsed_body
        .as_ref()
        .and_then(|value| value.get("stream"))
        .and_then(|value| value.as_bool())
    {
        Some(true) => ResponseShape::Streaming,
        _ => ResponseShape::Buffered,
    };

    let incoming_model_name = parsed_body
        .as_ref()
        .and_then(|value| value.get("model"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .or_else(|| deployment_name.clone());

    let prompt_text = parsed_body
        .as_ref()
        .and_then(|value| prompt_text_for_kind(call_kind, value));

    // Assistant ids can also arrive in the body of a create/run call.
    let assistant_id = assistant_id.or_else(|| {
        parsed_body
            .as_ref()
            .and_then(|value| value.get("assistant_id"))
            .and_then(|value| value.as_str())
            .map(str::to_string)
    });

    Ok(CallDetails {
        call_kind,
        method,
        incoming_model_name,
        deployment_name,
        assistant_id,
        prompt_text,
        response_shape,
        remaining_path,
        raw_body: body,
        consumer_id: None,
        preferred_endpoint_id,
    })
}

fn kind_from_tail(tail: &str) -> CallKind {
    match tail {
        "chat/completions" => CallKind::Chat,
        "completions" => CallKind::Completion,
        "embeddings" => CallKind::Embedding,
        "images/generations" => CallKind::ImageGeneration,
        "audio/transcriptions" => CallKind::Transcription,
        "audio/translations" => CallKind::Translation,
        _ if tail.starts_with("assistants") => CallKind::AssistantControl,
        _ => CallKind::Other,
    }
}

fn parse_body(
    call_kind: CallKind,
    method: HttpMethod,
    body: &Bytes,
) -> Result<Option<serde_json::Value>, GatewayError> {
    if method != HttpMethod::Post || body.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => Ok(Some(value)),
        // Unrecognised shapes proxy whatever they carry.
        Err(_) if call_kind == CallKind::Other => Ok(None),
        Err(err) => Err(GatewayError::bad_request(format!("invalid json: {err}"))),
    }
}

/// Prompt text used for logging and token estimation: chat messages joined
/// by newline, the completion `prompt`, or the embedding `input`.
fn prompt_text_for_kind(call_kind: CallKind, body: &serde_json::Value) -> Option<String> {
    match call_kind {
        CallKind::Chat | CallKind::AssistantControl => {
            let messages = body.get("messages")?.as_array()?;
            let parts: Vec<String> = messages
                .iter()
                .filter_map(|message| message.get("content"))
                .filter_map(content_as_text)
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        CallKind::Completion => body.get("prompt").and_then(content_as_text),
        CallKind::Embedding => body.get("input").and_then(content_as_text),
        _ => None,
    }
}

fn content_as_text(content: &serde_json::Value) -> Option<String> {
    match content {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(text) => Some(text.clone()),
                    serde_json::Value::Object(obj) => obj
                        .get("text")
                        .and_then(|text| text.as_str())
                        .map(str::to_string),
                    _ => None,
                })
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(path: &str, body: &str) -> CallDetails {
        classify_request(
            &Method::POST,
            path,
            &HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
        .unwrap()
    }

    #[test]
    fn azure_chat_path_is_recognised() {
        let details = classify(
            "/openai/deployments/prod-gpt4/chat/completions",
            r#"{"model":"Model1","messages":[{"role":"user","content":"hi"},{"role":"user","content":"there"}]}"#,
        );
        assert_eq!(details.call_kind, CallKind::Chat);
        assert_eq!(details.deployment_name.as_deref(), Some("prod-gpt4"));
        assert_eq!(details.incoming_model_name.as_deref(), Some("Model1"));
        assert_eq!(details.prompt_text.as_deref(), Some("hi\nthere"));
        assert_eq!(details.remaining_path, "chat/completions");
        assert_eq!(details.response_shape, ResponseShape::Buffered);
    }

    #[test]
    fn deployment_fills_model_when_body_has_none() {
        let details = classify(
            "/openai/deployments/prod-gpt4/embeddings",
            r#"{"input":"some text"}"#,
        );
        assert_eq!(details.call_kind, CallKind::Embedding);
        assert_eq!(details.incoming_model_name.as_deref(), Some("prod-gpt4"));
        assert_eq!(details.prompt_text.as_deref(), Some("some text"));
    }

    #[test]
    fn openai_shaped_path_is_recognised() {
        let details = classify(
            "/v1/chat/completions",
            r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        );
        assert_eq!(details.call_kind, CallKind::Chat);
        assert!(details.deployment_name.is_none());
        assert_eq!(details.response_shape, ResponseShape::Streaming);
    }

    #[test]
    fn stream_flag_must_be_boolean() {
        let details = classify(
            "/v1/chat/completions",
            r#"{"model":"gpt-4","messages":[],"stream":"true"}"#,
        );
        assert_eq!(details.response_shape, ResponseShape::Buffered);
    }

    #[test]
    fn assistants_path_carries_assistant_id() {
        let details = classify("/openai/assistants/assistant-123/messages", "{}");
        assert_eq!(details.call_kind, CallKind::AssistantControl);
        assert_eq!(details.assistant_id.as_deref(), Some("assistant-123"));
    }

    #[test]
    fn assistant_id_from_body_is_picked_up() {
        let details = classify(
            "/v1/threads/runs",
            r#"{"assistant_id":"assistant-123"}"#,
        );
        assert_eq!(details.assistant_id.as_deref(), Some("assistant-123"));
    }

    #[test]
    fn unknown_path_is_other_and_kept() {
        let details = classify("/internal/some/other/path", "");
        assert_eq!(details.call_kind, CallKind::Other);
        assert_eq!(details.remaining_path, "internal/some/other/path");
    }

    #[test]
    fn malformed_json_is_rejected_on_recognised_posts() {
        let err = classify_request(
            &Method::POST,
            "/v1/chat/completions",
            &HeaderMap::new(),
            Bytes::from_static(b"{not json"),
        )
        .unwrap_err();
        assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn affinity_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(AFFINITY_REQUEST_HEADER, "east".parse().unwrap());
        let details = classify_request(
            &Method::POST,
            "/v1/chat/completions",
            &headers,
            Bytes::from_static(b"{\"model\":\"m\",\"messages\":[]}"),
        )
        .unwrap();
        assert_eq!(details.preferred_endpoint_id.as_deref(), Some("east"));
    }
}
