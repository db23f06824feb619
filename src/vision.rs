//! Vision proxy
//!
//! When the chosen target cannot see images, each `image_url` part in the
//! converted messages is described by a separate non-streaming call to
//! Anthropic (using the client's own forwarded key) and replaced in place
//! with a `[Image Description: ...]` text block. The describe calls fan out
//! in parallel with a 30 s per-image deadline.
//!
//! Semantics are all-or-nothing: if every description succeeds, each image
//! is substituted at its exact (message, part) position; if any fails, the
//! whole batch is discarded and every image part is stripped instead -
//! losing a description is acceptable, corrupting block positions is not.

use std::time::Duration;

use serde_json::{json, Value};

use crate::util::split_data_url;

/// Model used for image description calls
pub const VISION_MODEL: &str = "claude-sonnet-4-20250514";

const DESCRIBE_PROMPT: &str =
    "Describe this image precisely and completely, so that an assistant that cannot \
     see it can still answer questions about it.";

const PER_IMAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the precondition did, for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionOutcome {
    NoImages,
    Described(usize),
    Stripped(usize),
}

/// Position of an image part inside the converted messages
struct ImageRef {
    msg_idx: usize,
    part_idx: usize,
    media_type: String,
    data: String,
}

fn find_images(messages: &Value) -> Vec<ImageRef> {
    let mut found = Vec::new();
    let Some(messages) = messages.as_array() else {
        return found;
    };
    for (msg_idx, message) in messages.iter().enumerate() {
        let Some(parts) = message.get("content").and_then(|c| c.as_array()) else {
            continue;
        };
        for (part_idx, part) in parts.iter().enumerate() {
            if part.get("type").and_then(|t| t.as_str()) != Some("image_url") {
                continue;
            }
            let Some(url) = part.pointer("/image_url/url").and_then(|u| u.as_str()) else {
                continue;
            };
            let Some((media_type, data)) = split_data_url(url) else {
                continue;
            };
            found.push(ImageRef {
                msg_idx,
                part_idx,
                media_type: media_type.to_string(),
                data: data.to_string(),
            });
        }
    }
    found
}

async fn describe_one(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    image: &ImageRef,
) -> anyhow::Result<String> {
    let body = json!({
        "model": VISION_MODEL,
        "max_tokens": 1024,
        "stream": false,
        "messages": [{
            "role": "user",
            "content": [
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": image.media_type,
                        "data": image.data,
                    }
                },
                {"type": "text", "text": DESCRIBE_PROMPT}
            ]
        }]
    });

    let send = client
        .post(format!("{}/v1/messages", base_url))
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .send();

    let response = tokio::time::timeout(PER_IMAGE_TIMEOUT, send).await??;
    if !response.status().is_success() {
        anyhow::bail!("vision call returned {}", response.status());
    }
    let parsed: Value = response.json().await?;
    parsed
        .pointer("/content/0/text")
        .and_then(|t| t.as_str())
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("vision response had no text block"))
}

/// Strip every image part; collapse emptied content arrays to `""` and
/// unwrap a single surviving text part to a plain string.
fn strip_images(messages: &mut Value) {
    let Some(messages) = messages.as_array_mut() else {
        return;
    };
    for message in messages {
        let Some(parts) = message.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };
        parts.retain(|p| p.get("type").and_then(|t| t.as_str()) != Some("image_url"));

        let collapsed: Option<Value> = match parts.len() {
            0 => Some(json!("")),
            1 if parts[0].get("type").and_then(|t| t.as_str()) == Some("text") => {
                parts[0].get("text").cloned()
            }
            _ => None,
        };
        if let Some(collapsed) = collapsed {
            message["content"] = collapsed;
        }
    }
}

/// Run the vision precondition over converted messages.
pub async fn describe_or_strip(
    messages: &mut Value,
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> VisionOutcome {
    let images = find_images(messages);
    if images.is_empty() {
        return VisionOutcome::NoImages;
    }

    if api_key.is_empty() {
        tracing::warn!(
            "{} image(s) in request but no API key to describe them; stripping",
            images.len()
        );
        strip_images(messages);
        return VisionOutcome::Stripped(images.len());
    }

    let descriptions = futures::future::join_all(
        images
            .iter()
            .map(|image| describe_one(client, base_url, api_key, image)),
    )
    .await;

    let count = images.len();
    if descriptions.iter().any(|d| d.is_err()) {
        for error in descriptions.iter().filter_map(|d| d.as_ref().err()) {
            tracing::warn!("vision describe failed: {}", error);
        }
        strip_images(messages);
        return VisionOutcome::Stripped(count);
    }

    for (image, description) in images.iter().zip(descriptions) {
        let description = description.expect("checked above");
        if let Some(part) = messages
            .get_mut(image.msg_idx)
            .and_then(|m| m.get_mut("content"))
            .and_then(|c| c.get_mut(image.part_idx))
        {
            *part = json!({
                "type": "text",
                "text": format!("[Image Description: {}]", description),
            });
        }
    }
    VisionOutcome::Described(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converted_messages() -> Value {
        json!([
            {"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}},
                {"type": "text", "text": "what is in the picture?"}
            ]}
        ])
    }

    #[test]
    fn test_find_images_positions() {
        let messages = converted_messages();
        let images = find_images(&messages);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].msg_idx, 0);
        assert_eq!(images[0].part_idx, 0);
        assert_eq!(images[0].media_type, "image/png");
    }

    #[test]
    fn test_strip_preserves_remaining_text() {
        let mut messages = converted_messages();
        strip_images(&mut messages);
        // Single surviving text part unwraps to a bare string
        assert_eq!(messages[0]["content"], "what is in the picture?");
    }

    #[test]
    fn test_strip_collapses_empty_to_string() {
        let mut messages = json!([
            {"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}}
            ]}
        ]);
        strip_images(&mut messages);
        assert_eq!(messages[0]["content"], "");
    }

    #[test]
    fn test_strip_keeps_multi_part_arrays() {
        let mut messages = json!([
            {"role": "user", "content": [
                {"type": "text", "text": "a"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}},
                {"type": "text", "text": "b"}
            ]}
        ]);
        strip_images(&mut messages);
        let parts = messages[0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "a");
        assert_eq!(parts[1]["text"], "b");
    }

    #[tokio::test]
    async fn test_no_images_is_a_no_op() {
        let mut messages = json!([{"role": "user", "content": "plain"}]);
        let client = reqwest::Client::new();
        let outcome =
            describe_or_strip(&mut messages, &client, "http://127.0.0.1:1", "key").await;
        assert_eq!(outcome, VisionOutcome::NoImages);
        assert_eq!(messages[0]["content"], "plain");
    }

    #[tokio::test]
    async fn test_unreachable_vision_endpoint_strips() {
        let mut messages = converted_messages();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let outcome =
            describe_or_strip(&mut messages, &client, "http://127.0.0.1:1", "key").await;
        assert_eq!(outcome, VisionOutcome::Stripped(1));
        assert_eq!(messages[0]["content"], "what is in the picture?");
    }

    #[tokio::test]
    async fn test_missing_key_strips() {
        let mut messages = converted_messages();
        let client = reqwest::Client::new();
        let outcome = describe_or_strip(&mut messages, &client, "http://127.0.0.1:1", "").await;
        assert_eq!(outcome, VisionOutcome::Stripped(1));
    }
}
