//! Finds the image a user wants edited: attached directly, inside a quoted
//! chain, or in a quoted message that has to be fetched from the platform.

use crate::content::{ImageSegment, IncomingMessage, Segment};
use crate::media;
use crate::platform::MessageQuery;
use reqwest::Client;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("The current adapter cannot fetch images from quoted messages")]
    Unsupported,
    #[error("Failed to fetch the quoted message: {0}")]
    FetchFailed(String),
    #[error("The quoted message has an unsupported format")]
    UnsupportedFormat,
    #[error("Failed to read the quoted image: {0}")]
    BadImage(String),
    #[error("No image found in the quoted message")]
    NotFound,
}

pub struct ImageResolver {
    client: Client,
}

impl ImageResolver {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }

    /// Images as `data:` URIs. `Ok` with an empty list means the message
    /// neither carried nor quoted an image.
    pub async fn resolve(
        &self,
        message: &IncomingMessage,
        query: Option<&dyn MessageQuery>,
    ) -> Result<Vec<String>, ResolveError> {
        let mut images = Vec::new();
        self.collect_segments(&message.segments, &mut images).await;
        if !images.is_empty() {
            return Ok(images);
        }

        let reply_ids = message.reply_ids();
        if reply_ids.is_empty() {
            return Ok(Vec::new());
        }

        let Some(query) = query else {
            return Err(ResolveError::Unsupported);
        };

        let mut last_error = None;
        for reply_id in &reply_ids {
            match self.fetch_quoted_images(query, reply_id).await {
                Ok(found) if !found.is_empty() => return Ok(found),
                Ok(_) => {}
                Err(err) => {
                    debug!(reply_id = %reply_id, error = %err, "Quoted message yielded no image");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(ResolveError::NotFound))
    }

    async fn collect_segments(&self, segments: &[Segment], images: &mut Vec<String>) {
        let mut ordered = Vec::new();
        image_refs_in_order(segments, &mut ordered);

        for image in ordered {
            match self.image_to_data_uri(image).await {
                Ok(uri) => images.push(uri),
                Err(err) => warn!(error = %err, "Failed to convert image to base64"),
            }
        }
    }

    async fn image_to_data_uri(&self, image: &ImageSegment) -> Result<String, String> {
        if let Some(uri) = image.inline_data_uri() {
            return Ok(uri);
        }
        if let Some(url) = image.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return self
                .download_as_data_uri(url)
                .await
                .ok_or_else(|| "failed to download image".to_string());
        }
        if let Some(path) = &image.path {
            return read_file_as_data_uri(path).await;
        }
        Err("image has no usable source".to_string())
    }

    async fn fetch_quoted_images(
        &self,
        query: &dyn MessageQuery,
        reply_id: &str,
    ) -> Result<Vec<String>, ResolveError> {
        let message_id = match reply_id.parse::<i64>() {
            Ok(numeric) if reply_id.chars().all(|c| c.is_ascii_digit()) => json!(numeric),
            _ => json!(reply_id),
        };

        let result = query
            .call_action("get_msg", json!({ "message_id": message_id }))
            .await
            .map_err(|e| ResolveError::FetchFailed(e.to_string()))?;

        if !result.is_object() {
            return Err(ResolveError::FetchFailed(
                "unexpected response format".to_string(),
            ));
        }
        if let Some(status) = result.get("status").and_then(Value::as_str) {
            if !status.is_empty() && status != "ok" {
                return Err(ResolveError::FetchFailed(format!("status={}", status)));
            }
        }
        match result.get("retcode") {
            None | Some(Value::Null) => {}
            Some(code) if code.as_i64() == Some(0) => {}
            Some(code) => return Err(ResolveError::FetchFailed(format!("retcode={}", code))),
        }

        let data = result.get("data").filter(|d| d.is_object()).unwrap_or(&result);
        let Some(segments) = data.get("message").and_then(Value::as_array) else {
            return Err(ResolveError::UnsupportedFormat);
        };

        let mut images = Vec::new();
        let mut errors = Vec::new();
        for segment in segments {
            if segment.get("type").and_then(Value::as_str) != Some("image") {
                continue;
            }
            let Some(fields) = segment.get("data").filter(|d| d.is_object()) else {
                continue;
            };
            match self.quoted_segment_to_data_uri(fields, query).await {
                Ok(uri) => images.push(uri),
                Err(err) => errors.push(err),
            }
        }

        if !images.is_empty() {
            return Ok(images);
        }
        if let Some(first) = errors.into_iter().next() {
            return Err(ResolveError::BadImage(first));
        }
        Err(ResolveError::NotFound)
    }

    /// Tries inline base64, then a direct URL, then a file id, then a local path.
    async fn quoted_segment_to_data_uri(
        &self,
        fields: &Value,
        query: &dyn MessageQuery,
    ) -> Result<String, String> {
        let inline = ["base64", "b64"]
            .iter()
            .find_map(|key| non_empty_str(fields.get(*key)));
        if let Some(b64) = inline {
            return Ok(media::normalize_inline(b64));
        }

        if let Some(url) = non_empty_str(fields.get("url")) {
            return self
                .download_as_data_uri(url)
                .await
                .ok_or_else(|| "failed to download quoted image".to_string());
        }

        let file_id = ["file", "file_id"]
            .iter()
            .find_map(|key| match fields.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            });
        if let Some(file_id) = file_id {
            if let Some(b64) = file_id.strip_prefix("base64://") {
                return Ok(media::normalize_inline(b64));
            }
            if let Some(url) = self.lookup_image_url(query, &file_id).await {
                return self
                    .download_as_data_uri(&url)
                    .await
                    .ok_or_else(|| "failed to download quoted image".to_string());
            }
        }

        if let Some(path) = non_empty_str(fields.get("path")) {
            let path = Path::new(path);
            if path.is_file() {
                return read_file_as_data_uri(path).await;
            }
        }

        Err("image segment has no usable url or file".to_string())
    }

    async fn lookup_image_url(&self, query: &dyn MessageQuery, file_id: &str) -> Option<String> {
        let result = match query
            .call_action("get_image", json!({ "file": file_id }))
            .await
        {
            Ok(result) => result,
            Err(err) => {
                debug!(file_id = %file_id, error = %err, "get_image failed");
                return None;
            }
        };
        let data = result.get("data").filter(|d| d.is_object()).unwrap_or(&result);
        ["url", "download_url"]
            .iter()
            .find_map(|key| non_empty_str(data.get(*key)))
            .map(str::to_string)
    }

    pub async fn download_as_data_uri(&self, url: &str) -> Option<String> {
        let response = match self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, error = %err, "Failed to download quoted image");
                return None;
            }
        };
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match response.bytes().await {
            Ok(bytes) => Some(media::encode_data_uri(
                &media::image_mime_from_content_type(content_type.as_deref()),
                &bytes,
            )),
            Err(err) => {
                warn!(url = %url, error = %err, "Failed to read quoted image body");
                None
            }
        }
    }
}

/// Document order: a quoted chain's images sit where the quote does.
fn image_refs_in_order<'a>(segments: &'a [Segment], out: &mut Vec<&'a ImageSegment>) {
    for segment in segments {
        match segment {
            Segment::Image(image) => out.push(image),
            Segment::Reply(_) => {
                if let Some(chain) = segment.as_reply_chain() {
                    image_refs_in_order(chain, out);
                }
            }
            _ => {}
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

async fn read_file_as_data_uri(path: &Path) -> Result<String, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("failed to read image file {}: {}", path.display(), e))?;
    let mime = media::guess_mime_from_path(path).unwrap_or(media::DEFAULT_IMAGE_MIME);
    Ok(media::encode_data_uri(mime, &bytes))
}

#[cfg(test)]
mod tests {
    use super::{ImageResolver, ResolveError};
    use crate::content::{ImageSegment, IncomingMessage, ReplySegment, Segment};
    use crate::platform::MessageQuery;
    use anyhow::anyhow;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves the same response to every request and returns the base URL.
    async fn serve(status: u16, content_type: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let header = format!(
                        "HTTP/1.1 {} Test\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        status,
                        content_type,
                        body.len()
                    );
                    let _ = stream.write_all(header.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    /// Answers actions from a fixed table keyed by `action:id` and records
    /// every call.
    #[derive(Default)]
    struct StubQuery {
        answers: HashMap<String, Value>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl StubQuery {
        fn answer(mut self, key: &str, value: Value) -> Self {
            self.answers.insert(key.to_string(), value);
            self
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl MessageQuery for StubQuery {
        async fn call_action(&self, action: &str, params: Value) -> anyhow::Result<Value> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((action.to_string(), params.clone()));
            let id = params
                .get("message_id")
                .or_else(|| params.get("file"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            self.answers
                .get(&format!("{}:{}", action, id))
                .cloned()
                .ok_or_else(|| anyhow!("no such {} {}", action, id))
        }
    }

    fn resolver() -> ImageResolver {
        ImageResolver::new().expect("resolver")
    }

    fn quoted(id: &str) -> IncomingMessage {
        IncomingMessage::new("u1", Some("g1".into()))
            .with_segment(Segment::Reply(ReplySegment::to(id)))
            .with_segment(Segment::Text("edit".into()))
    }

    fn get_msg_answer(segments: Value) -> Value {
        json!({"status": "ok", "retcode": 0, "data": {"message": segments}})
    }

    #[tokio::test]
    async fn message_images_keep_document_order() {
        let message = IncomingMessage::new("u1", None)
            .with_segment(Segment::Image(ImageSegment::inline("AAAA")))
            .with_segment(Segment::Reply(ReplySegment::with_chain(vec![
                Segment::Image(ImageSegment::inline("data:image/png;base64,BBBB")),
                Segment::Reply(ReplySegment::with_chain(vec![Segment::Image(
                    ImageSegment::inline("CCCC"),
                )])),
            ])))
            .with_segment(Segment::Image(ImageSegment::inline("DDDD")));

        let images = resolver().resolve(&message, None).await.expect("images");
        assert_eq!(
            images,
            vec![
                "data:image/jpeg;base64,AAAA",
                "data:image/png;base64,BBBB",
                "data:image/jpeg;base64,CCCC",
                "data:image/jpeg;base64,DDDD",
            ]
        );
    }

    #[tokio::test]
    async fn quoted_image_before_attachment_is_edited_first() {
        let message = IncomingMessage::new("u1", Some("g1".into()))
            .with_segment(Segment::Reply(ReplySegment::with_chain(vec![Segment::Image(
                ImageSegment::inline("UVVPVEVE"),
            )])))
            .with_segment(Segment::Text("make it brighter".into()))
            .with_segment(Segment::Image(ImageSegment::inline("QVRUQUNIRUQ=")));

        let images = resolver().resolve(&message, None).await.expect("images");
        assert_eq!(
            images.first().map(String::as_str),
            Some("data:image/jpeg;base64,UVVPVEVE")
        );
        assert_eq!(images.len(), 2);
    }

    #[tokio::test]
    async fn url_image_is_downloaded_with_its_content_type() {
        let base = serve(200, "image/png; charset=binary", b"png-bytes").await;
        let message = IncomingMessage::new("u1", None)
            .with_segment(Segment::Image(ImageSegment::from_url(format!("{}/cat", base))));

        let images = resolver().resolve(&message, None).await.expect("images");
        assert_eq!(images, vec!["data:image/png;base64,cG5nLWJ5dGVz"]);
    }

    #[tokio::test]
    async fn non_image_content_type_falls_back_to_jpeg() {
        let base = serve(200, "application/octet-stream", b"jpg").await;
        let uri = resolver()
            .download_as_data_uri(&format!("{}/blob", base))
            .await
            .expect("downloaded");
        assert_eq!(uri, "data:image/jpeg;base64,anBn");
    }

    #[tokio::test]
    async fn failed_download_yields_nothing() {
        let base = serve(404, "text/plain", b"gone").await;
        assert_eq!(
            resolver()
                .download_as_data_uri(&format!("{}/missing.png", base))
                .await,
            None
        );

        let message = IncomingMessage::new("u1", None).with_segment(Segment::Image(
            ImageSegment::from_url(format!("{}/missing.png", base)),
        ));
        let images = resolver().resolve(&message, None).await.expect("no error");
        assert!(images.is_empty());
    }

    #[tokio::test]
    async fn quoted_file_id_is_downloaded_via_get_image() {
        let base = serve(200, "image/webp", b"webp").await;
        let query = StubQuery::default()
            .answer(
                "get_msg:12",
                get_msg_answer(json!([{"type": "image", "data": {"file": "f1.image"}}])),
            )
            .answer(
                "get_image:f1.image",
                json!({"status": "ok", "data": {"url": format!("{}/f1", base)}}),
            );

        let images = resolver()
            .resolve(&quoted("12"), Some(&query))
            .await
            .expect("images");
        assert_eq!(images, vec!["data:image/webp;base64,d2VicA=="]);
        let calls = query.calls();
        assert_eq!(calls[1].0, "get_image");
    }

    #[tokio::test]
    async fn quoted_url_download_failure_is_a_bad_image() {
        let base = serve(500, "text/plain", b"oops").await;
        let query = StubQuery::default().answer(
            "get_msg:13",
            get_msg_answer(json!([{"type": "image", "data": {"url": format!("{}/x.png", base)}}])),
        );
        let err = resolver()
            .resolve(&quoted("13"), Some(&query))
            .await
            .expect_err("download fails");
        assert_eq!(
            err,
            ResolveError::BadImage("failed to download quoted image".into())
        );
    }

    #[tokio::test]
    async fn local_path_image_is_read_and_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cat.png");
        std::fs::write(&path, b"png-bytes").expect("write");

        let message = IncomingMessage::new("u1", None)
            .with_segment(Segment::Image(ImageSegment::from_path(&path)));
        let images = resolver().resolve(&message, None).await.expect("images");
        assert_eq!(images, vec!["data:image/png;base64,cG5nLWJ5dGVz"]);
    }

    #[tokio::test]
    async fn unreadable_direct_image_is_skipped() {
        let message = IncomingMessage::new("u1", None)
            .with_segment(Segment::Image(ImageSegment::from_path("/nonexistent/x.png")))
            .with_segment(Segment::Image(ImageSegment::inline("AAAA")));
        let images = resolver().resolve(&message, None).await.expect("images");
        assert_eq!(images, vec!["data:image/jpeg;base64,AAAA"]);
    }

    #[tokio::test]
    async fn plain_text_yields_nothing_without_error() {
        let message =
            IncomingMessage::new("u1", None).with_segment(Segment::Text("hello".into()));
        let images = resolver().resolve(&message, None).await.expect("no error");
        assert!(images.is_empty());
    }

    #[tokio::test]
    async fn quoted_message_needs_query_capability() {
        let err = resolver()
            .resolve(&quoted("5"), None)
            .await
            .expect_err("unsupported");
        assert_eq!(err, ResolveError::Unsupported);
    }

    #[tokio::test]
    async fn quoted_message_is_fetched_with_numeric_id() {
        let query = StubQuery::default().answer(
            "get_msg:5",
            get_msg_answer(json!([
                {"type": "text", "data": {"text": "look"}},
                {"type": "image", "data": {"base64": "QUJD"}}
            ])),
        );

        let images = resolver()
            .resolve(&quoted("5"), Some(&query))
            .await
            .expect("images");
        assert_eq!(images, vec!["data:image/jpeg;base64,QUJD"]);
        let calls = query.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "get_msg");
        assert_eq!(calls[0].1, json!({"message_id": 5}));
    }

    #[tokio::test]
    async fn non_numeric_id_is_sent_as_string() {
        let query = StubQuery::default().answer(
            "get_msg:abc-1",
            get_msg_answer(json!([{"type": "image", "data": {"file": "base64://WFla"}}])),
        );
        let images = resolver()
            .resolve(&quoted("abc-1"), Some(&query))
            .await
            .expect("images");
        assert_eq!(images, vec!["data:image/jpeg;base64,WFla"]);
        assert_eq!(query.calls()[0].1, json!({"message_id": "abc-1"}));
    }

    #[tokio::test]
    async fn file_id_falls_back_to_local_path_when_lookup_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("quoted.jpg");
        std::fs::write(&path, b"jpg").expect("write");

        let query = StubQuery::default().answer(
            "get_msg:8",
            get_msg_answer(json!([{
                "type": "image",
                "data": {"file": "abc.image", "path": path.to_string_lossy()}
            }])),
        );
        let images = resolver()
            .resolve(&quoted("8"), Some(&query))
            .await
            .expect("images");
        assert_eq!(images, vec!["data:image/jpeg;base64,anBn"]);

        let calls = query.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "get_image");
        assert_eq!(calls[1].1, json!({"file": "abc.image"}));
    }

    #[tokio::test]
    async fn failed_status_is_reported() {
        let query = StubQuery::default().answer(
            "get_msg:5",
            json!({"status": "failed", "retcode": 100, "data": null}),
        );
        let err = resolver()
            .resolve(&quoted("5"), Some(&query))
            .await
            .expect_err("status failure");
        assert_eq!(err, ResolveError::FetchFailed("status=failed".into()));
    }

    #[tokio::test]
    async fn nonzero_retcode_is_reported() {
        let query = StubQuery::default().answer("get_msg:5", json!({"retcode": 1404}));
        let err = resolver()
            .resolve(&quoted("5"), Some(&query))
            .await
            .expect_err("retcode failure");
        assert_eq!(err, ResolveError::FetchFailed("retcode=1404".into()));
    }

    #[tokio::test]
    async fn unusable_image_segment_reports_first_error() {
        let query = StubQuery::default().answer(
            "get_msg:5",
            get_msg_answer(json!([{"type": "image", "data": {"summary": "[image]"}}])),
        );
        let err = resolver()
            .resolve(&quoted("5"), Some(&query))
            .await
            .expect_err("bad segment");
        assert_eq!(
            err,
            ResolveError::BadImage("image segment has no usable url or file".into())
        );
    }

    #[tokio::test]
    async fn message_without_list_is_unsupported() {
        let query = StubQuery::default()
            .answer("get_msg:5", json!({"status": "ok", "data": {"message": "[CQ:image]"}}));
        let err = resolver()
            .resolve(&quoted("5"), Some(&query))
            .await
            .expect_err("format");
        assert_eq!(err, ResolveError::UnsupportedFormat);
    }

    #[tokio::test]
    async fn later_reply_is_tried_after_failure() {
        let query = StubQuery::default().answer(
            "get_msg:2",
            get_msg_answer(json!([{"type": "image", "data": {"b64": "T0s="}}])),
        );
        let message = IncomingMessage::new("u1", None)
            .with_segment(Segment::Reply(ReplySegment::to("1")))
            .with_segment(Segment::Reply(ReplySegment::to("2")));

        let images = resolver()
            .resolve(&message, Some(&query))
            .await
            .expect("second reply resolves");
        assert_eq!(images, vec!["data:image/jpeg;base64,T0s="]);
    }

    #[tokio::test]
    async fn last_error_wins_when_every_reply_fails() {
        let query = StubQuery::default()
            .answer("get_msg:1", json!({"retcode": 7}))
            .answer("get_msg:2", get_msg_answer(json!([{"type": "text"}])));
        let message = IncomingMessage::new("u1", None)
            .with_segment(Segment::Reply(ReplySegment::to("1")))
            .with_segment(Segment::Reply(ReplySegment::to("2")));

        let err = resolver()
            .resolve(&message, Some(&query))
            .await
            .expect_err("nothing found");
        assert_eq!(err, ResolveError::NotFound);
    }
}
