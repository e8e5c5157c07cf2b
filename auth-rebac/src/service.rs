use crate::debug::REQUEST_DEBUG_INFORMATION;
use crate::models::*;
use async_trait::async_trait;
use futures::channel::oneshot;
use futures::stream::BoxStream;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::Status;

pub mod memory;

/// Server-streamed relationships.
///
/// `relationships` ends with `None` on a normal end of stream. Trailers of a
/// streaming call only exist once the stream has ended, so they arrive on a
/// separate channel the transport completes after the last message.
pub struct RelationshipStream {
    pub relationships: BoxStream<'static, Result<RelationshipTuple, Status>>,
    trailers: oneshot::Receiver<MetadataMap>,
}

impl RelationshipStream {
    pub fn new(
        relationships: BoxStream<'static, Result<RelationshipTuple, Status>>,
        trailers: oneshot::Receiver<MetadataMap>,
    ) -> Self {
        Self {
            relationships,
            trailers,
        }
    }

    /// Stream whose trailers are already known.
    pub fn with_trailers(
        relationships: BoxStream<'static, Result<RelationshipTuple, Status>>,
        trailers: MetadataMap,
    ) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(trailers);
        Self::new(relationships, receiver)
    }

    /// Trailers sent so far; empty until the transport has delivered them.
    pub fn trailers(&mut self) -> MetadataMap {
        match self.trailers.try_recv() {
            Ok(Some(trailers)) => trailers,
            Ok(None) | Err(_) => MetadataMap::new(),
        }
    }
}

impl std::fmt::Debug for RelationshipStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipStream").finish_non_exhaustive()
    }
}

/// Per-call request options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallMeta {
    /// Ask the service to attach debug information to the response trailers.
    pub debug: bool,
}

impl CallMeta {
    /// Request headers a gRPC transport attaches to the call.
    pub fn request_metadata(&self) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        if self.debug {
            metadata.insert(REQUEST_DEBUG_INFORMATION, MetadataValue::from_static("true"));
        }
        metadata
    }
}

/// A response together with the trailers the service sent
#[derive(Debug)]
pub struct Traced<T> {
    pub value: T,
    pub trailers: MetadataMap,
}

impl<T> Traced<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            trailers: MetadataMap::new(),
        }
    }

    pub fn with_trailers(value: T, trailers: MetadataMap) -> Self {
        Self { value, trailers }
    }
}

/// Remote relationship-based permission service.
///
/// Transport setup (dial, TLS, server lifecycle) belongs to whoever builds the
/// implementation; the client only issues these calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Streams every relationship matching the filter. Trailers come with
    /// the stream, after its last item.
    async fn read_relationships(
        &self,
        request: ReadRelationshipsRequest,
        meta: CallMeta,
    ) -> Result<RelationshipStream, Status>;

    /// Applies all updates atomically
    async fn write_relationships(
        &self,
        request: WriteRelationshipsRequest,
        meta: CallMeta,
    ) -> Result<Traced<WriteRelationshipsResponse>, Status>;

    /// Deletes every relationship matching the filter atomically
    async fn delete_relationships(
        &self,
        request: DeleteRelationshipsRequest,
        meta: CallMeta,
    ) -> Result<Traced<DeleteRelationshipsResponse>, Status>;

    async fn check_permission(
        &self,
        request: CheckPermissionRequest,
        meta: CallMeta,
    ) -> Result<Traced<CheckPermissionResponse>, Status>;

    /// Replaces the schema, returning when it was written
    async fn write_schema(&self, schema: String, meta: CallMeta) -> Result<Traced<ConsistencyToken>, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn debug_requests_carry_header() {
        let metadata = CallMeta { debug: true }.request_metadata();
        assert_eq!(
            metadata.get(REQUEST_DEBUG_INFORMATION).and_then(|v| v.to_str().ok()),
            Some("true")
        );
        assert!(CallMeta::default().request_metadata().is_empty());
    }

    #[test]
    fn stream_trailers_arrive_after_transport_sends_them() {
        let (sender, receiver) = oneshot::channel();
        let mut stream = RelationshipStream::new(futures::stream::empty().boxed(), receiver);
        assert!(stream.trailers().is_empty());

        let mut trailers = MetadataMap::new();
        trailers.insert(crate::debug::DISPATCHED_OPERATIONS_COUNT, MetadataValue::from(2u64));
        sender.send(trailers).unwrap();
        assert_eq!(stream.trailers().len(), 1);
    }

    #[test]
    fn dropped_sender_yields_no_trailers() {
        let (sender, receiver) = oneshot::channel::<MetadataMap>();
        drop(sender);
        let mut stream = RelationshipStream::new(futures::stream::empty().boxed(), receiver);
        assert!(stream.trailers().is_empty());
    }
}
