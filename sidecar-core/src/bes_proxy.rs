//! Fan-out proxy for the build-event publishing service.
//!
//! Each inbound client stream is relayed to every configured backend
//! target, in arrival order per target. The first configured target is
//! the primary: its acks flow back to the client. A mandatory target
//! failing mid-stream fails the whole client stream with that target's
//! status, after cancelling the remaining legs; best-effort targets
//! only log.

use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backends::BesBackend;
use crate::pb::publish_build_event::publish_build_event_client::PublishBuildEventClient;
use crate::pb::publish_build_event::publish_build_event_server::PublishBuildEvent;
use crate::pb::publish_build_event::{
    PublishBuildToolEventStreamRequest, PublishBuildToolEventStreamResponse,
    PublishLifecycleEventRequest, PublishLifecycleEventResponse,
};
use crate::relay::{forward_request, size_limit_violation, RELAY_BUFFER};

type EventTx = mpsc::Sender<PublishBuildToolEventStreamRequest>;
type AckTx = mpsc::Sender<Result<PublishBuildToolEventStreamResponse, Status>>;

pub struct BuildEventProxy {
    targets: Vec<BesBackend>,
    max_message_bytes: usize,
}

impl BuildEventProxy {
    pub fn new(targets: Vec<BesBackend>, max_message_bytes: usize) -> Self {
        Self {
            targets,
            max_message_bytes,
        }
    }
}

#[tonic::async_trait]
impl PublishBuildEvent for BuildEventProxy {
    async fn publish_lifecycle_event(
        &self,
        request: Request<PublishLifecycleEventRequest>,
    ) -> Result<Response<PublishLifecycleEventResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        let encoded_len = message.encoded_len();
        if encoded_len > self.max_message_bytes {
            return Err(size_limit_violation(
                "lifecycle event",
                encoded_len,
                self.max_message_bytes,
            ));
        }
        for target in &self.targets {
            let mut client = PublishBuildEventClient::new(target.channel.clone());
            match client
                .publish_lifecycle_event(forward_request(message.clone(), &metadata))
                .await
            {
                Ok(_) => {}
                Err(status) if target.best_effort => {
                    warn!(
                        address = %target.address,
                        %status,
                        "best-effort lifecycle target failed"
                    );
                }
                Err(status) => return Err(status),
            }
        }
        Ok(Response::new(PublishLifecycleEventResponse {}))
    }

    type PublishBuildToolEventStreamStream =
        ReceiverStream<Result<PublishBuildToolEventStreamResponse, Status>>;

    async fn publish_build_tool_event_stream(
        &self,
        request: Request<Streaming<PublishBuildToolEventStreamRequest>>,
    ) -> Result<Response<Self::PublishBuildToolEventStreamStream>, Status> {
        let (metadata, _, inbound) = request.into_parts();
        let (ack_tx, ack_rx) = mpsc::channel(RELAY_BUFFER);
        let targets = self.targets.clone();
        let max_message_bytes = self.max_message_bytes;
        let session = Uuid::new_v4();

        tokio::spawn(async move {
            run_fanout(session, targets, metadata, inbound, ack_tx, max_message_bytes).await;
        });

        Ok(Response::new(ReceiverStream::new(ack_rx)))
    }
}

/// Terminal outcome of one outbound leg.
struct LegOutcome {
    index: usize,
    result: Result<(), Status>,
}

/// Drive one fan-out session: forward every inbound event to every leg
/// in order, then drain all legs before signaling completion. Leg tasks
/// live in a `JoinSet` so a failure can cancel the siblings and nothing
/// outlives the session.
async fn run_fanout(
    session: Uuid,
    targets: Vec<BesBackend>,
    metadata: MetadataMap,
    mut inbound: Streaming<PublishBuildToolEventStreamRequest>,
    ack_tx: AckTx,
    max_message_bytes: usize,
) {
    debug!(%session, targets = targets.len(), "opening build-event fan-out session");

    let mut legs: JoinSet<LegOutcome> = JoinSet::new();
    let mut senders: Vec<Option<EventTx>> = Vec::with_capacity(targets.len());

    for (index, target) in targets.iter().enumerate() {
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        senders.push(Some(tx));
        let channel = target.channel.clone();
        let metadata = metadata.clone();
        // Only the primary target's acks are relayed to the client.
        let primary_acks = (index == 0).then(|| ack_tx.clone());
        legs.spawn(async move {
            let result = run_target_leg(channel, metadata, rx, primary_acks).await;
            LegOutcome { index, result }
        });
    }

    let mut failure: Option<Status> = None;

    // Forward phase. Watching the join set alongside the inbound leg
    // means a mandatory failure is noticed even while the client is
    // quiet between events.
    loop {
        tokio::select! {
            message = inbound.message() => match message {
                Ok(Some(event)) => {
                    let encoded_len = event.encoded_len();
                    if encoded_len > max_message_bytes {
                        failure =
                            Some(size_limit_violation("build event", encoded_len, max_message_bytes));
                        break;
                    }
                    for slot in senders.iter_mut() {
                        let closed = match slot {
                            Some(tx) => tx.send(event.clone()).await.is_err(),
                            None => false,
                        };
                        if closed {
                            // Leg ended; its outcome arrives via the join set.
                            *slot = None;
                        }
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    // Client cancelled or failed its leg; tear down all
                    // outbound legs rather than leaving them orphaned.
                    debug!(%session, %status, "client leg ended, cancelling fan-out legs");
                    legs.abort_all();
                    return;
                }
            },
            Some(joined) = legs.join_next() => {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        failure = Some(Status::internal(format!(
                            "fan-out leg failed: {}",
                            join_err
                        )));
                        break;
                    }
                };
                let target = &targets[outcome.index];
                senders[outcome.index] = None;
                if target.best_effort {
                    if let Err(status) = outcome.result {
                        warn!(
                            %session,
                            address = %target.address,
                            %status,
                            "best-effort build-event target dropped mid-stream"
                        );
                    }
                } else {
                    // A mandatory leg finishing before the client
                    // half-closed is a failure either way: later events
                    // could no longer reach it.
                    failure = Some(match outcome.result {
                        Ok(()) => Status::aborted(format!(
                            "build-event backend {} closed the stream early",
                            target.address
                        )),
                        Err(status) => status,
                    });
                    break;
                }
            }
        }
    }

    if let Some(status) = failure {
        warn!(%session, %status, "build-event fan-out failed");
        legs.abort_all();
        let _ = ack_tx.send(Err(status)).await;
        return;
    }

    // Drain phase: half-close every leg, then wait for all targets to
    // complete before the client sees completion.
    senders.clear();
    while let Some(joined) = legs.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => {
                legs.abort_all();
                let _ = ack_tx
                    .send(Err(Status::internal(format!(
                        "fan-out leg failed: {}",
                        join_err
                    ))))
                    .await;
                return;
            }
        };
        let target = &targets[outcome.index];
        if let Err(status) = outcome.result {
            if target.best_effort {
                warn!(
                    %session,
                    address = %target.address,
                    %status,
                    "best-effort build-event target failed during drain"
                );
            } else {
                warn!(
                    %session,
                    address = %target.address,
                    %status,
                    "build-event target failed during drain"
                );
                legs.abort_all();
                let _ = ack_tx.send(Err(status)).await;
                return;
            }
        }
    }

    debug!(%session, "build-event fan-out session complete");
    // Dropping ack_tx ends the client's ack stream cleanly.
}

/// One outbound leg: stream the relayed events to the target and
/// consume its acks until the target completes.
async fn run_target_leg(
    channel: Channel,
    metadata: MetadataMap,
    events: mpsc::Receiver<PublishBuildToolEventStreamRequest>,
    primary_acks: Option<AckTx>,
) -> Result<(), Status> {
    let mut client = PublishBuildEventClient::new(channel);
    let outbound = forward_request(ReceiverStream::new(events), &metadata);
    let mut acks = client
        .publish_build_tool_event_stream(outbound)
        .await?
        .into_inner();

    while let Some(ack) = acks.message().await? {
        if let Some(tx) = &primary_acks {
            // If the client stopped reading acks the session is being
            // torn down; keep draining so the leg can finish cleanly.
            let _ = tx.send(Ok(ack)).await;
        }
    }
    Ok(())
}
