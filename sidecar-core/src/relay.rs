//! Streaming relay plumbing shared by the cache and build-event proxies.

use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Status, Streaming};

/// In-flight message bound for every relayed stream. Kept small: the
/// peer leg provides the real backpressure, the channel only smooths
/// scheduling jitter.
pub const RELAY_BUFFER: usize = 4;

/// Build an outbound request carrying the inbound call's metadata, so
/// deadlines and credential headers ride through unchanged. The sidecar
/// invents no timeout policy of its own.
pub fn forward_request<T>(message: T, metadata: &MetadataMap) -> Request<T> {
    let mut request = Request::new(message);
    *request.metadata_mut() = metadata.clone();
    request
}

/// The sidecar-originated rejection for a message over the configured
/// bound, distinct from any backend status.
pub fn size_limit_violation(what: &str, encoded_len: usize, limit: usize) -> Status {
    Status::resource_exhausted(format!(
        "{} is {} bytes, exceeds the sidecar limit of {} bytes",
        what, encoded_len, limit
    ))
}

/// Relay a backend server-streaming response to the client leg, one
/// message at a time.
///
/// The client leg consumes the returned stream; if it hangs up, the
/// channel send fails, the task exits and dropping `inbound` cancels
/// the backend leg. A backend error is forwarded as the stream's final
/// item, status untouched. Messages over `max_message_bytes` terminate
/// the stream with a sidecar-originated RESOURCE_EXHAUSTED.
pub fn spawn_server_stream_relay<T>(
    mut inbound: Streaming<T>,
    max_message_bytes: usize,
) -> ReceiverStream<Result<T, Status>>
where
    T: Message + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    tokio::spawn(async move {
        loop {
            match inbound.message().await {
                Ok(Some(message)) => {
                    let encoded_len = message.encoded_len();
                    if encoded_len > max_message_bytes {
                        let _ = tx
                            .send(Err(size_limit_violation(
                                "relayed message",
                                encoded_len,
                                max_message_bytes,
                            )))
                            .await;
                        break;
                    }
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    let _ = tx.send(Err(status)).await;
                    break;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;
    use tonic::Code;

    #[test]
    fn forward_request_copies_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-build-tool", MetadataValue::from_static("bazel"));
        metadata.insert("grpc-timeout", MetadataValue::from_static("30S"));

        let request = forward_request(42u32, &metadata);
        assert_eq!(
            request.metadata().get("x-build-tool").unwrap(),
            &MetadataValue::from_static("bazel")
        );
        assert_eq!(
            request.metadata().get("grpc-timeout").unwrap(),
            &MetadataValue::from_static("30S")
        );
    }

    #[test]
    fn size_limit_violation_is_resource_exhausted() {
        let status = size_limit_violation("batch update request", 2048, 1024);
        assert_eq!(status.code(), Code::ResourceExhausted);
        assert!(status.message().contains("2048"));
        assert!(status.message().contains("1024"));
    }
}
