//! `data:` URI helpers.

use anyhow::{anyhow, Result};
use base64::Engine;
use std::path::Path;

pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// Wraps bare base64 into a JPEG-tagged data URI; complete URIs pass through.
pub fn normalize_inline(payload: &str) -> String {
    if payload.starts_with("data:") {
        payload.to_string()
    } else {
        format!("data:{};base64,{}", DEFAULT_IMAGE_MIME, payload)
    }
}

pub fn encode_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_type,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Decoded `data:image/<subtype>;base64,<payload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub extension: String,
    pub bytes: Vec<u8>,
}

pub fn decode_data_uri(uri: &str) -> Result<InlineImage> {
    let rest = uri
        .strip_prefix("data:image/")
        .ok_or_else(|| anyhow!("not an image data URI"))?;
    let (subtype, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| anyhow!("data URI is not base64 encoded"))?;
    let valid_subtype = !subtype.is_empty()
        && subtype
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'));
    if !valid_subtype {
        return Err(anyhow!("invalid image subtype '{}'", subtype));
    }
    let payload: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if payload.is_empty() {
        return Err(anyhow!("empty image payload"));
    }
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload.as_bytes())?;
    Ok(InlineImage {
        extension: subtype.to_ascii_lowercase(),
        bytes,
    })
}

pub fn guess_mime_from_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension().and_then(|v| v.to_str())?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => return None,
    };
    Some(mime)
}

/// Media type from a `Content-Type` header value, defaulting to JPEG for
/// anything that is not an image.
pub fn image_mime_from_content_type(content_type: Option<&str>) -> String {
    let mime = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if mime.starts_with("image/") {
        mime
    } else {
        DEFAULT_IMAGE_MIME.to_string()
    }
}
