use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoChangeMembershipReq, ProtoChangeMembershipResult,
    ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::transport::StreamLayer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Status;

/// RaftClient is a handle to one peer's raft RPC service. The underlying channel is dialed through
/// the stream layer on first use and shared by every clone of the handle. A call that fails at the
/// transport level drops the channel so the next call dials again.
#[derive(Clone)]
pub(crate) struct RaftClient {
    logger: slog::Logger,
    address: String,
    stream_layer: Arc<StreamLayer>,
    dial_timeout: Duration,
    channel: Arc<Mutex<Option<GrpcRaftClient<Channel>>>>,
}

impl RaftClient {
    pub(crate) fn new(logger: slog::Logger, address: String, stream_layer: Arc<StreamLayer>, dial_timeout: Duration) -> Self {
        RaftClient {
            logger,
            address,
            stream_layer,
            dial_timeout,
            channel: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    async fn connected(&self) -> Result<GrpcRaftClient<Channel>, Status> {
        let mut guard = self.channel.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", self.address))
            .map_err(|e| Status::invalid_argument(format!("Bad peer address {:?}: {}", self.address, e)))?;

        let stream_layer = self.stream_layer.clone();
        let address = self.address.clone();
        let dial_timeout = self.dial_timeout;
        let connector = tower::service_fn(move |_: Uri| {
            let stream_layer = stream_layer.clone();
            let address = address.clone();
            async move { stream_layer.dial(&address, dial_timeout).await }
        });

        let channel = endpoint
            .connect_with_connector(connector)
            .await
            .map_err(|e| Status::unavailable(format!("Failed to connect to {}: {}", self.address, e)))?;
        slog::debug!(self.logger, "Connected to {}", self.address);

        let client = GrpcRaftClient::new(channel);
        guard.replace(client.clone());
        Ok(client)
    }

    async fn forget_channel_on_failure<T>(&self, result: &Result<T, Status>) {
        if let Err(status) = result {
            if matches!(status.code(), tonic::Code::Unavailable | tonic::Code::Unknown) {
                self.channel.lock().await.take();
            }
        }
    }

    pub(crate) async fn request_vote(&self, request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let mut client = self.connected().await?;
        let result = client.request_vote(request).await.map(|r| r.into_inner());
        self.forget_channel_on_failure(&result).await;
        result
    }

    pub(crate) async fn append_entries(
        &self,
        request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let mut client = self.connected().await?;
        let result = client.append_entries(request).await.map(|r| r.into_inner());
        self.forget_channel_on_failure(&result).await;
        result
    }

    pub(crate) async fn install_snapshot(
        &self,
        request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let mut client = self.connected().await?;
        let result = client.install_snapshot(request).await.map(|r| r.into_inner());
        self.forget_channel_on_failure(&result).await;
        result
    }

    pub(crate) async fn change_membership(
        &self,
        request: ProtoChangeMembershipReq,
    ) -> Result<ProtoChangeMembershipResult, Status> {
        let mut client = self.connected().await?;
        let result = client.change_membership(request).await.map(|r| r.into_inner());
        self.forget_channel_on_failure(&result).await;
        result
    }
}
