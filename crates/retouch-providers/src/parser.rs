//! Image extraction from loosely structured chat-completion answers.
//!
//! Upstream answers come in several shapes: an images-API style `data` list,
//! structured `choices[0].message.content` parts, free text with markdown or
//! HTML image references, inline `data:` URIs, and attachment-like lists on
//! the message. All of them are scanned and the results merged.

use crate::{EditError, EditedImages};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

const MIN_URL_LEN: usize = 10;
const ATTACHMENT_FIELDS: [&str; 4] = ["attachments", "media", "files", "images"];
const FORBIDDEN_URL_CHARS: [char; 7] = ['<', '>', '"', '\'', '\n', '\r', '\t'];

struct ImagePatterns {
    html_img: Regex,
    markdown_img: Regex,
    direct_url: Regex,
    data_uri: Regex,
    extension: Regex,
}

fn patterns() -> &'static ImagePatterns {
    static PATTERNS: OnceLock<ImagePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ImagePatterns {
        html_img: Regex::new(r#"(?i)<img[^>]*src=["']([^"']+)["'][^>]*>"#).unwrap(),
        markdown_img: Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").unwrap(),
        direct_url: Regex::new(
            r#"(?i)(https?://[^\s<>"')\]}]+\.(?:png|jpg|jpeg|webp|gif)(?:\?[^\s<>"')\]}]*)?)"#,
        )
        .unwrap(),
        data_uri: Regex::new(r"(?i)(data:image/(?:png|jpeg|jpg|webp|gif);base64,[A-Za-z0-9+/=]+)")
            .unwrap(),
        extension: Regex::new(r"(?i)\.(png|jpg|jpeg|webp|gif)(?:$|[?&#])").unwrap(),
    })
}

/// Accepts http(s) URLs of reasonable length without markup characters.
/// With `require_extension` the path must end in a known image extension,
/// optionally followed by a query or fragment.
pub fn is_valid_image_url(url: &str, require_extension: bool) -> bool {
    if url.len() < MIN_URL_LEN {
        return false;
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return false;
    }
    if require_extension && !patterns().extension.is_match(url) {
        return false;
    }
    !url.contains(FORBIDDEN_URL_CHARS)
}

pub fn extract_urls_from_text(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    let patterns = patterns();
    let mut urls = Vec::new();

    for caps in patterns.html_img.captures_iter(content) {
        let candidate = &caps[1];
        if is_valid_image_url(candidate, false) {
            urls.push(candidate.to_string());
        }
    }
    for caps in patterns.markdown_img.captures_iter(content) {
        let candidate = &caps[1];
        if is_valid_image_url(candidate, false) {
            urls.push(candidate.to_string());
        }
    }
    for caps in patterns.direct_url.captures_iter(content) {
        let candidate = &caps[1];
        if is_valid_image_url(candidate, true) {
            urls.push(candidate.to_string());
        }
    }
    urls
}

pub fn extract_data_uris_from_text(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    patterns()
        .data_uri
        .captures_iter(content)
        .map(|caps| caps[1].to_string())
        .collect()
}

fn dedupe_preserve(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn push_valid_url(urls: &mut Vec<String>, candidate: Option<&Value>) {
    if let Some(url) = candidate.and_then(Value::as_str) {
        if is_valid_image_url(url, false) {
            urls.push(url.to_string());
        }
    }
}

fn scan_text(text: &str, urls: &mut Vec<String>, data_uris: &mut Vec<String>) {
    urls.extend(extract_urls_from_text(text));
    data_uris.extend(extract_data_uris_from_text(text));
}

fn scan_message(message: &Value, urls: &mut Vec<String>, data_uris: &mut Vec<String>) {
    match message.get("content") {
        Some(Value::Array(parts)) => {
            let mut text_parts: Vec<&str> = Vec::new();
            for part in parts.iter().filter(|p| p.is_object()) {
                match part.get("type").and_then(Value::as_str) {
                    Some("image_url") => {
                        let candidate = match part.get("image_url") {
                            Some(Value::Object(field)) => field.get("url"),
                            _ => part.get("url"),
                        };
                        push_valid_url(urls, candidate);
                    }
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            text_parts.push(text);
                        }
                    }
                    _ => {}
                }
            }
            if !text_parts.is_empty() {
                scan_text(&text_parts.join("\n"), urls, data_uris);
            }
        }
        Some(Value::String(text)) => scan_text(text, urls, data_uris),
        _ => {}
    }

    for field in ATTACHMENT_FIELDS {
        if let Some(Value::Array(items)) = message.get(field) {
            for item in items {
                push_valid_url(urls, item.get("url"));
            }
        }
    }
}

/// Collects every image reference in `response`. Fails only when nothing
/// usable was found.
pub fn extract_images(response: &Value) -> Result<EditedImages, EditError> {
    let Value::Object(root) = response else {
        return Err(EditError::InvalidResponse(
            json_type_name(response).to_string(),
        ));
    };

    let mut urls: Vec<String> = Vec::new();
    let mut data_uris: Vec<String> = Vec::new();

    if let Some(Value::Array(items)) = root.get("data") {
        for item in items.iter().filter(|i| i.is_object()) {
            push_valid_url(&mut urls, item.get("url"));
            if let Some(b64) = item.get("b64_json").and_then(Value::as_str) {
                if !b64.is_empty() {
                    data_uris.push(format!("data:image/png;base64,{}", b64));
                }
            }
        }
    }

    let message = root
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .filter(|message| message.is_object());
    if let Some(message) = message {
        scan_message(message, &mut urls, &mut data_uris);
    }

    let images = EditedImages {
        urls: dedupe_preserve(urls),
        data_uris: dedupe_preserve(data_uris),
    };
    if images.is_empty() {
        return Err(EditError::NoImages);
    }
    tracing::debug!(
        count = images.len(),
        urls = images.urls.len(),
        inline = images.data_uris.len(),
        "Extracted edited images"
    );
    Ok(images)
}
