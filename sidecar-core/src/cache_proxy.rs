//! Transparent relay for the four remote-cache RPC families.
//!
//! Every call is forwarded over the single cache backend channel with
//! its payload, status codes and metadata untouched. The only local
//! policy is the configured maximum message size: oversized payloads
//! are rejected with a sidecar-originated RESOURCE_EXHAUSTED before
//! they reach the backend (or the client, for the response direction),
//! and the advertised capabilities are clamped so clients never build
//! a batch the sidecar would refuse.
//!
//! The backend-facing clients run with their own decode bound out of
//! the way (`usize::MAX`); the explicit checks below are the size
//! policy, which keeps the rejection code distinct from the transport's.

use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::pb::bytestream::byte_stream_client::ByteStreamClient;
use crate::pb::bytestream::byte_stream_server::ByteStream;
use crate::pb::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use crate::pb::remote_execution::action_cache_client::ActionCacheClient;
use crate::pb::remote_execution::action_cache_server::ActionCache;
use crate::pb::remote_execution::capabilities_client::CapabilitiesClient;
use crate::pb::remote_execution::capabilities_server::Capabilities;
use crate::pb::remote_execution::content_addressable_storage_client::ContentAddressableStorageClient;
use crate::pb::remote_execution::content_addressable_storage_server::ContentAddressableStorage;
use crate::pb::remote_execution::{
    ActionResult, BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, FindMissingBlobsRequest, FindMissingBlobsResponse,
    GetActionResultRequest, GetCapabilitiesRequest, GetTreeRequest, GetTreeResponse,
    ServerCapabilities, UpdateActionResultRequest,
};
use crate::relay::{
    forward_request, size_limit_violation, spawn_server_stream_relay, RELAY_BUFFER,
};

/// Pass-through proxy for CAS, action cache, byte-stream and
/// capabilities calls, all multiplexed over one backend channel.
#[derive(Clone)]
pub struct CacheProxy {
    channel: Channel,
    max_message_bytes: usize,
}

impl CacheProxy {
    pub fn new(channel: Channel, max_message_bytes: usize) -> Self {
        Self {
            channel,
            max_message_bytes,
        }
    }

    fn bytestream_client(&self) -> ByteStreamClient<Channel> {
        ByteStreamClient::new(self.channel.clone()).max_decoding_message_size(usize::MAX)
    }

    fn cas_client(&self) -> ContentAddressableStorageClient<Channel> {
        ContentAddressableStorageClient::new(self.channel.clone())
            .max_decoding_message_size(usize::MAX)
    }

    fn action_cache_client(&self) -> ActionCacheClient<Channel> {
        ActionCacheClient::new(self.channel.clone()).max_decoding_message_size(usize::MAX)
    }

    fn capabilities_client(&self) -> CapabilitiesClient<Channel> {
        CapabilitiesClient::new(self.channel.clone())
    }

    fn check_size(&self, what: &str, encoded_len: usize) -> Result<(), Status> {
        if encoded_len > self.max_message_bytes {
            Err(size_limit_violation(what, encoded_len, self.max_message_bytes))
        } else {
            Ok(())
        }
    }
}

#[tonic::async_trait]
impl ActionCache for CacheProxy {
    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let (metadata, _, message) = request.into_parts();
        let response = self
            .action_cache_client()
            .get_action_result(forward_request(message, &metadata))
            .await?;
        self.check_size("action result", response.get_ref().encoded_len())?;
        Ok(response)
    }

    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let (metadata, _, message) = request.into_parts();
        self.check_size("action result update", message.encoded_len())?;
        self.action_cache_client()
            .update_action_result(forward_request(message, &metadata))
            .await
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for CacheProxy {
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        self.check_size("find missing blobs request", message.encoded_len())?;
        self.cas_client()
            .find_missing_blobs(forward_request(message, &metadata))
            .await
    }

    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        self.check_size("batch update request", message.encoded_len())?;
        self.cas_client()
            .batch_update_blobs(forward_request(message, &metadata))
            .await
    }

    async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        self.check_size("batch read request", message.encoded_len())?;
        let response = self
            .cas_client()
            .batch_read_blobs(forward_request(message, &metadata))
            .await?;
        self.check_size("batch read response", response.get_ref().encoded_len())?;
        Ok(response)
    }

    type GetTreeStream = ReceiverStream<Result<GetTreeResponse, Status>>;

    async fn get_tree(
        &self,
        request: Request<GetTreeRequest>,
    ) -> Result<Response<Self::GetTreeStream>, Status> {
        let (metadata, _, message) = request.into_parts();
        let inbound = self
            .cas_client()
            .get_tree(forward_request(message, &metadata))
            .await?
            .into_inner();
        Ok(Response::new(spawn_server_stream_relay(
            inbound,
            self.max_message_bytes,
        )))
    }
}

#[tonic::async_trait]
impl Capabilities for CacheProxy {
    async fn get_capabilities(
        &self,
        request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        let (metadata, _, message) = request.into_parts();
        let mut response = self
            .capabilities_client()
            .get_capabilities(forward_request(message, &metadata))
            .await?;
        clamp_batch_size(response.get_mut(), self.max_message_bytes);
        Ok(response)
    }
}

#[tonic::async_trait]
impl ByteStream for CacheProxy {
    type ReadStream = ReceiverStream<Result<ReadResponse, Status>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let (metadata, _, message) = request.into_parts();
        debug!(
            resource = %message.resource_name,
            offset = message.read_offset,
            "relaying byte-stream read"
        );
        let inbound = self
            .bytestream_client()
            .read(forward_request(message, &metadata))
            .await?
            .into_inner();
        Ok(Response::new(spawn_server_stream_relay(
            inbound,
            self.max_message_bytes,
        )))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let (metadata, _, mut inbound) = request.into_parts();
        let limit = self.max_message_bytes;
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);

        // Client leg: pull chunks one at a time and hand them to the
        // backend leg. The bounded channel stalls this loop whenever
        // the backend is slower than the client, so at no point does
        // more than a handful of chunks sit in memory.
        let client_leg = tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(chunk)) => {
                        let encoded_len = chunk.encoded_len();
                        if encoded_len > limit {
                            return Err(size_limit_violation("write chunk", encoded_len, limit));
                        }
                        if tx.send(chunk).await.is_err() {
                            // Backend leg ended first; its status is
                            // what the client will see.
                            return Ok(());
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(status) => return Err(status),
                }
            }
        });

        let backend_result = self
            .bytestream_client()
            .write(forward_request(ReceiverStream::new(rx), &metadata))
            .await;

        // Once the backend has answered the call is over; an idle
        // client leg must not keep it open. Aborting a finished task
        // still yields its result, so a client-side failure (bad chunk,
        // client error) takes precedence over a truncated backend call.
        client_leg.abort();
        match client_leg.await {
            Ok(Ok(())) => backend_result,
            Ok(Err(status)) => Err(status),
            Err(join_err) if join_err.is_cancelled() => backend_result,
            Err(join_err) => Err(Status::internal(format!(
                "write relay task failed: {}",
                join_err
            ))),
        }
    }

    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        self.bytestream_client()
            .query_write_status(forward_request(message, &metadata))
            .await
    }
}

/// Advertise the tighter of the backend's batch limit and our own
/// message bound, so clients never build a batch we would reject.
fn clamp_batch_size(capabilities: &mut ServerCapabilities, max_message_bytes: usize) {
    if let Some(cache) = capabilities.cache_capabilities.as_mut() {
        let local = max_message_bytes as i64;
        if cache.max_batch_total_size_bytes == 0 || cache.max_batch_total_size_bytes > local {
            cache.max_batch_total_size_bytes = local;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::remote_execution::CacheCapabilities;

    fn capabilities(max_batch: i64) -> ServerCapabilities {
        ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_functions: vec!["SHA256".to_string()],
                max_batch_total_size_bytes: max_batch,
            }),
        }
    }

    #[test]
    fn clamps_backend_limit_above_ours() {
        let mut caps = capabilities(64 * 1024 * 1024);
        clamp_batch_size(&mut caps, 4 * 1024 * 1024);
        assert_eq!(
            caps.cache_capabilities.unwrap().max_batch_total_size_bytes,
            4 * 1024 * 1024
        );
    }

    #[test]
    fn keeps_backend_limit_below_ours() {
        let mut caps = capabilities(1024);
        clamp_batch_size(&mut caps, 4 * 1024 * 1024);
        assert_eq!(
            caps.cache_capabilities.unwrap().max_batch_total_size_bytes,
            1024
        );
    }

    #[test]
    fn unset_backend_limit_becomes_ours() {
        let mut caps = capabilities(0);
        clamp_batch_size(&mut caps, 1 << 20);
        assert_eq!(
            caps.cache_capabilities.unwrap().max_batch_total_size_bytes,
            1 << 20
        );
    }

    #[test]
    fn missing_cache_capabilities_left_alone() {
        let mut caps = ServerCapabilities {
            cache_capabilities: None,
        };
        clamp_batch_size(&mut caps, 1 << 20);
        assert!(caps.cache_capabilities.is_none());
    }
}
