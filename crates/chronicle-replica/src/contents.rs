//! Media content query surface: raw buffers, cached decodings, or URLs.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

use chronicle_core::{BlobError, ContentHash, MediaInfo};

use crate::blob_store::{BlobStore, Decoded};
use crate::error::ReplicaError;
use crate::media_sync::describe;
use crate::replica::PartitionReplica;
use crate::upstream::{MediaRequest, UpstreamConnection, UpstreamContent};

/// Default size above which URL requests are not inlined as data URIs.
pub const DEFAULT_INLINE_THRESHOLD: usize = 48_000;

/// Turns a buffer into some richer form. Results are cached per blob under
/// the decoder id while the blob is held in memory.
pub trait MediaDecoder: Send + Sync {
    fn id(&self) -> &str;

    fn decode(&self, buffer: &[u8]) -> Result<Decoded, ReplicaError>;
}

/// Decodes UTF-8 text into a `String`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Decoder;

impl MediaDecoder for Utf8Decoder {
    fn id(&self) -> &str {
        "utf8"
    }

    fn decode(&self, buffer: &[u8]) -> Result<Decoded, ReplicaError> {
        let text = std::str::from_utf8(buffer).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        Ok(Arc::new(text.to_string()))
    }
}

/// What form of content a request wants.
#[derive(Clone)]
pub enum ContentKind {
    Buffer,
    Decoded(Arc<dyn MediaDecoder>),
    Url,
}

#[derive(Clone)]
pub struct ContentRequest {
    pub media_id: String,
    pub kind: ContentKind,
}

impl ContentRequest {
    pub fn buffer(media_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            kind: ContentKind::Buffer,
        }
    }

    pub fn decoded(media_id: impl Into<String>, decoder: Arc<dyn MediaDecoder>) -> Self {
        Self {
            media_id: media_id.into(),
            kind: ContentKind::Decoded(decoder),
        }
    }

    pub fn url(media_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            kind: ContentKind::Url,
        }
    }
}

#[derive(Clone)]
pub enum MediaContent {
    Buffer(Bytes),
    Decoded(Decoded),
    Url(String),
}

impl std::fmt::Debug for MediaContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaContent::Buffer(buffer) => write!(f, "Buffer({} bytes)", buffer.len()),
            MediaContent::Decoded(_) => write!(f, "Decoded(..)"),
            MediaContent::Url(url) => write!(f, "Url({url})"),
        }
    }
}

impl MediaContent {
    pub fn as_buffer(&self) -> Option<&Bytes> {
        match self {
            MediaContent::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            MediaContent::Url(url) => Some(url),
            _ => None,
        }
    }

    /// The decoded value, if it has type `T`.
    pub fn decoded<T: 'static>(&self) -> Option<&T> {
        match self {
            MediaContent::Decoded(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

/// `data:` URI for a buffer.
pub fn data_uri(mime_type: Option<&str>, buffer: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_type.unwrap_or("application/octet-stream"),
        STANDARD.encode(buffer)
    )
}

/// Decode through the blob store's decoding cache.
pub(crate) fn decode_cached(
    blobs: &BlobStore,
    content_hash: &ContentHash,
    buffer: &[u8],
    decoder: &dyn MediaDecoder,
) -> Result<Decoded, ReplicaError> {
    if let Some(cached) = blobs.cached_decoding(content_hash, decoder.id()) {
        return Ok(cached);
    }
    let decoded = decoder.decode(buffer)?;
    blobs.store_decoding(content_hash, decoder.id(), decoded.clone());
    Ok(decoded)
}

impl PartitionReplica {
    /// Content of media resources in the requested forms, one result per
    /// request.
    ///
    /// Media ids unknown to this partition are looked up among the media of
    /// every locally persisted partition.
    pub async fn request_media_contents(
        &self,
        requests: &[ContentRequest],
    ) -> Vec<Result<MediaContent, ReplicaError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.media_content(request).await);
        }
        results
    }

    async fn media_content(&self, request: &ContentRequest) -> Result<MediaContent, ReplicaError> {
        let info = self
            .resolve_media_info(&request.media_id)
            .or_else(|| {
                self.inner
                    .persisted_media
                    .get(&request.media_id)
                    .map(|entry| entry.media_info)
            })
            .ok_or_else(|| ReplicaError::MediaNotFound(request.media_id.clone()))?;
        let connection = self.connection();

        match &request.kind {
            ContentKind::Buffer => {
                let buffer = self.media_buffer(&info, connection.as_deref()).await?;
                Ok(MediaContent::Buffer(buffer))
            }
            ContentKind::Decoded(decoder) => {
                let content_hash = info
                    .content_hash
                    .clone()
                    .ok_or_else(|| ReplicaError::MediaUnavailable(describe(&info)))?;
                if let Some(cached) = self.inner.blobs.cached_decoding(&content_hash, decoder.id()) {
                    return Ok(MediaContent::Decoded(cached));
                }
                let buffer = self.media_buffer(&info, connection.as_deref()).await?;
                let decoded = decode_cached(&self.inner.blobs, &content_hash, &buffer, decoder.as_ref())?;
                Ok(MediaContent::Decoded(decoded))
            }
            ContentKind::Url => {
                let Some(connection) = connection else {
                    let buffer = self.media_buffer(&info, None).await?;
                    return Ok(MediaContent::Url(data_uri(info.mime_type.as_deref(), &buffer)));
                };
                if let Some(content_hash) = &info.content_hash {
                    if let Ok(buffer) = self.inner.blobs.read(content_hash).await {
                        if buffer.len() <= self.inner.config.inline_threshold {
                            return Ok(MediaContent::Url(data_uri(info.mime_type.as_deref(), &buffer)));
                        }
                    }
                }
                upstream_url(connection.as_ref(), &info).await.map(MediaContent::Url)
            }
        }
    }

    async fn media_buffer(
        &self,
        info: &MediaInfo,
        connection: Option<&dyn UpstreamConnection>,
    ) -> Result<Bytes, ReplicaError> {
        let content_hash = info
            .content_hash
            .as_ref()
            .ok_or_else(|| ReplicaError::MediaUnavailable(describe(info)))?;

        match self.inner.blobs.read(content_hash).await {
            Ok(buffer) => Ok(buffer),
            Err(BlobError::NotFound(_)) => match connection {
                Some(connection) => upstream_buffer(connection, info, content_hash).await,
                None => Err(ReplicaError::MediaUnavailable(describe(info))),
            },
            Err(e) => Err(e.into()),
        }
    }
}

async fn upstream_buffer(
    connection: &dyn UpstreamConnection,
    info: &MediaInfo,
    content_hash: &ContentHash,
) -> Result<Bytes, ReplicaError> {
    let request = MediaRequest {
        media_info: info.clone(),
        as_url: false,
    };
    let contents = connection
        .request_media_contents(std::slice::from_ref(&request))
        .await?;
    match contents.into_iter().next() {
        Some(UpstreamContent::Buffer(buffer)) if content_hash.matches(&buffer) => Ok(buffer),
        Some(UpstreamContent::Buffer(buffer)) => Err(ReplicaError::HashMismatch {
            declared: content_hash.clone(),
            actual: ContentHash::of(&buffer),
        }),
        _ => Err(ReplicaError::MediaRetrieval {
            media: describe(info),
            reason: "upstream returned no buffer".to_string(),
        }),
    }
}

async fn upstream_url(connection: &dyn UpstreamConnection, info: &MediaInfo) -> Result<String, ReplicaError> {
    let request = MediaRequest {
        media_info: info.clone(),
        as_url: true,
    };
    let contents = connection
        .request_media_contents(std::slice::from_ref(&request))
        .await?;
    match contents.into_iter().next() {
        Some(UpstreamContent::Url(url)) => Ok(url),
        _ => Err(ReplicaError::MediaRetrieval {
            media: describe(info),
            reason: "upstream returned no URL".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_sync::retriever;
    use crate::receive::ReceiveOptions;
    use crate::test_support::{connected_replica, media_event, memory_replica, CollectingSink, FakeUpstream};
    use crate::ReplicaConfig;

    async fn replica_with_text(text: &'static str) -> (PartitionReplica, ContentHash) {
        let (replica, _) = memory_replica(true).await;
        let content = Bytes::from_static(text.as_bytes());
        let hash = ContentHash::of(&content);
        replica
            .receive_truths(
                vec![media_event(0, "doc", &hash)],
                ReceiveOptions {
                    retrieve: Some(retriever(move |_| {
                        let content = content.clone();
                        async move { Ok::<_, ReplicaError>(content) }
                    })),
                    ..ReceiveOptions::default()
                },
            )
            .await
            .unwrap();
        (replica, hash)
    }

    #[tokio::test]
    async fn test_request_buffer_decoded_and_url() {
        let (replica, hash) = replica_with_text("hello").await;

        let results = replica
            .request_media_contents(&[
                ContentRequest::buffer("doc"),
                ContentRequest::decoded("doc", Arc::new(Utf8Decoder)),
                ContentRequest::url("doc"),
                ContentRequest::buffer("nope"),
            ])
            .await;

        assert_eq!(results[0].as_ref().unwrap().as_buffer().map(|b| b.as_ref()), Some(&b"hello"[..]));
        assert_eq!(
            results[1].as_ref().unwrap().decoded::<String>().map(String::as_str),
            Some("hello")
        );
        assert_eq!(
            results[2].as_ref().unwrap().as_url(),
            Some("data:text/plain;base64,aGVsbG8=")
        );
        assert!(matches!(results[3], Err(ReplicaError::MediaNotFound(_))));
        assert_eq!(replica.inner.blobs.snapshot(&hash).unwrap().decodings, 1);
    }

    #[tokio::test]
    async fn test_decoding_reused_across_requests() {
        struct CountingDecoder(std::sync::atomic::AtomicUsize);

        impl MediaDecoder for CountingDecoder {
            fn id(&self) -> &str {
                "counting"
            }

            fn decode(&self, buffer: &[u8]) -> Result<Decoded, ReplicaError> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Arc::new(buffer.len()))
            }
        }

        let (replica, hash) = replica_with_text("twelve bytes").await;
        let decoder = Arc::new(CountingDecoder(std::sync::atomic::AtomicUsize::new(0)));
        let request = ContentRequest::decoded("doc", decoder.clone());

        for _ in 0..2 {
            let results = replica.request_media_contents(&[request.clone()]).await;
            assert_eq!(results[0].as_ref().unwrap().decoded::<usize>(), Some(&12));
        }

        assert_eq!(decoder.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(replica.inner.blobs.cached_decoding(&hash, "counting").is_some());
    }

    #[tokio::test]
    async fn test_large_media_url_deferred_upstream() {
        let upstream = Arc::new(FakeUpstream::default());
        let config = ReplicaConfig {
            inline_threshold: 4,
            ..ReplicaConfig::default()
        };
        let (replica, _) = connected_replica(config, upstream, Arc::new(CollectingSink::default())).await;
        let content = Bytes::from_static(b"longer than four");
        let hash = ContentHash::of(&content);
        replica.inner.blobs.write(content, &hash, 0).await.unwrap();
        replica
            .receive_truths(vec![media_event(0, "doc", &hash)], ReceiveOptions::default())
            .await
            .unwrap();

        let results = replica.request_media_contents(&[ContentRequest::url("doc")]).await;
        let url = results[0].as_ref().unwrap().as_url().unwrap().to_string();
        assert_eq!(url, format!("https://upstream.test/{}", hash));
    }

    #[test]
    fn test_data_uri() {
        assert_eq!(
            data_uri(Some("text/plain"), b"hello"),
            "data:text/plain;base64,aGVsbG8="
        );
        assert!(data_uri(None, b"").starts_with("data:application/octet-stream;base64,"));
    }

    #[test]
    fn test_utf8_decoder() {
        let decoded = Utf8Decoder.decode(b"hello").unwrap();
        assert_eq!(decoded.downcast_ref::<String>().map(String::as_str), Some("hello"));
        assert!(matches!(
            Utf8Decoder.decode(&[0xff, 0xfe]),
            Err(ReplicaError::Decode(_))
        ));
    }

    #[test]
    fn test_content_accessors() {
        let content = MediaContent::Decoded(Arc::new(7u32));
        assert_eq!(content.decoded::<u32>(), Some(&7));
        assert!(content.decoded::<String>().is_none());
        assert!(content.as_buffer().is_none());
        assert_eq!(format!("{:?}", MediaContent::Buffer(Bytes::from_static(b"abc"))), "Buffer(3 bytes)");
    }
}
