use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use super::{BatchOp, Document, DocumentStore, Query, SnapshotStream, UpdateOp};
use crate::error::StorageError;
use crate::storage::{BlobStore, MediaUpload};

/// Client for the document store hosted by `umuw serve`.
#[derive(Clone)]
pub struct HttpDocumentStore {
    client: Client,
    base: Url,
}

#[derive(Deserialize)]
struct Inserted {
    id: String,
}

#[derive(Deserialize)]
struct Uploaded {
    url: String,
}

impl HttpDocumentStore {
    pub fn new(base: Url) -> Self {
        Self {
            client: Client::new(),
            base,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, StorageError> {
        self.base
            .join(path)
            .map_err(|e| StorageError::Unavailable(format!("bad endpoint {}: {}", path, e)))
    }

    fn document_url(&self, collection: &str, id: &str) -> Result<Url, StorageError> {
        let mut url = self.endpoint("v1/collections/")?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Unavailable("base url cannot carry a path".into()))?
            .pop_if_empty()
            .push(collection)
            .push(id);
        Ok(url)
    }

    fn collection_url(&self, collection: &str) -> Result<Url, StorageError> {
        let mut url = self.endpoint("v1/collections/")?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Unavailable("base url cannot carry a path".into()))?
            .pop_if_empty()
            .push(collection);
        Ok(url)
    }
}

/// Map non-success statuses onto the storage taxonomy.
async fn check(response: Response, what: &str) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => StorageError::not_found(what, message),
        StatusCode::CONFLICT => StorageError::Conflict(message),
        _ => StorageError::Rejected {
            status: status.as_u16(),
            message,
        },
    })
}

/// Parse one server-sent event frame into a snapshot.
fn parse_frame(frame: &str) -> Option<Result<Vec<Document>, StorageError>> {
    let mut event = "message";
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim();
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() {
        // keep-alive comment
        return None;
    }
    if event == "error" {
        return Some(Err(StorageError::Unavailable(data)));
    }
    Some(serde_json::from_str(&data).map_err(StorageError::from))
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn insert(&self, collection: &str, data: Value) -> Result<String, StorageError> {
        let response = self
            .client
            .post(self.collection_url(collection)?)
            .json(&data)
            .send()
            .await?;
        let inserted: Inserted = check(response, collection).await?.json().await?;
        Ok(inserted.id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        let response = self
            .client
            .get(self.document_url(collection, id)?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: Document = check(response, collection).await?.json().await?;
        Ok(Some(doc))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        ops: Vec<UpdateOp>,
    ) -> Result<(), StorageError> {
        let response = self
            .client
            .patch(self.document_url(collection, id)?)
            .json(&ops)
            .send()
            .await?;
        check(response, collection).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .delete(self.document_url(collection, id)?)
            .send()
            .await?;
        check(response, collection).await?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StorageError> {
        let response = self
            .client
            .post(self.endpoint("v1/query")?)
            .json(query)
            .send()
            .await?;
        let docs: Vec<Document> = check(response, &query.collection).await?.json().await?;
        Ok(docs)
    }

    async fn subscribe(&self, query: Query) -> Result<SnapshotStream, StorageError> {
        let response = self
            .client
            .post(self.endpoint("v1/watch")?)
            .json(&query)
            .send()
            .await?;
        let mut body = Box::pin(check(response, &query.collection).await?.bytes_stream());
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(StorageError::from(e))).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                // SSE allows CRLF line endings; normalize before framing.
                if buffer.contains(&b'\r') {
                    let cleaned: Vec<u8> = buffer.iter().copied().filter(|b| *b != b'\r').collect();
                    buffer = BytesMut::from(&cleaned[..]);
                }
                while let Some(end) = find_frame_end(&buffer) {
                    let frame = buffer.split_to(end + 2);
                    let text = String::from_utf8_lossy(&frame);
                    if let Some(item) = parse_frame(&text) {
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = tx
                .send(Err(StorageError::Unavailable(
                    "subscription closed by server".into(),
                )))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn commit(&self, batch: Vec<BatchOp>) -> Result<(), StorageError> {
        let response = self
            .client
            .post(self.endpoint("v1/batch")?)
            .json(&batch)
            .send()
            .await?;
        check(response, "batch").await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for HttpDocumentStore {
    async fn put(&self, upload: &MediaUpload) -> Result<String, StorageError> {
        let mut url = self.endpoint("v1/uploads")?;
        url.query_pairs_mut().append_pair("name", &upload.file_name);
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, upload.mime_type.clone())
            .body(upload.bytes.clone())
            .send()
            .await?;
        let uploaded: Uploaded = check(response, "uploads").await?.json().await?;
        // The server answers with a path; make it durable for other devices.
        let absolute = self.endpoint(uploaded.url.trim_start_matches('/'))?;
        Ok(absolute.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> HttpDocumentStore {
        HttpDocumentStore::new(Url::parse("http://example.test:3000/").unwrap())
    }

    #[test]
    fn document_url_escapes_segments() {
        let url = store().document_url("posts", "a b/c").unwrap();
        assert_eq!(
            url.as_str(),
            "http://example.test:3000/v1/collections/posts/a%20b%2Fc"
        );
    }

    #[test]
    fn collection_url_has_no_trailing_slash() {
        let url = store().collection_url("pendingUsers").unwrap();
        assert_eq!(
            url.as_str(),
            "http://example.test:3000/v1/collections/pendingUsers"
        );
    }

    #[test]
    fn parse_frame_reads_snapshot() {
        let frame = "data: [{\"id\":\"a\",\"data\":{\"x\":1}}]\n\n";
        let docs = parse_frame(frame).unwrap().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "a");
    }

    #[test]
    fn parse_frame_surfaces_error_events() {
        let frame = "event: error\ndata: database locked\n\n";
        assert!(matches!(
            parse_frame(frame),
            Some(Err(StorageError::Unavailable(_)))
        ));
    }

    #[test]
    fn parse_frame_ignores_keep_alive() {
        assert!(parse_frame(":\n\n").is_none());
    }

    #[test]
    fn frame_end_found_after_blank_line() {
        assert_eq!(find_frame_end(b"data: 1\n\ndata: 2"), Some(7));
        assert_eq!(find_frame_end(b"data: 1\n"), None);
    }
}
