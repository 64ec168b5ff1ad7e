use crate::commitlog;
use crate::replica;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Design choice: Disk interaction is synchronous inside the actor. The actor is the only thing that
//                touches the log, stable state and snapshot store, so none of them need locks.
//
// Design choice: Network calls to peers are spawned as tasks. Their replies come back to the actor
//                as `*ReplyFromPeer` events.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Append entry, reply once it's applied.
    // Candidate: Reject request.
    // Follower: Redirect.
    Apply(replica::ApplyInput, Callback<replica::ApplyOutput, replica::ApplyError>),

    // Leader: Append config entry, reply once it's applied.
    // Candidate: Reject request.
    // Follower: Redirect.
    ChangeMembership(
        replica::ChangeMembershipInput,
        Callback<replica::ChangeMembershipOutput, replica::ChangeMembershipError>,
    ),

    // Leader: Grant vote if applicable (includes write to disk). Transition to follower.
    // Candidate: Grant vote if applicable (includes write to disk). Transition to follower.
    // Follower: Grant vote if applicable (includes write to disk).
    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),

    // Leader: discard
    // Candidate: Update local state. Transition to leader if quorum vote.
    // Follower: discard
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader: Transition to follower if applicable. Clean up log. Respond to request.
    // Candidate: Transition to follower if applicable. Clean up log. Respond to request.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),

    // Leader: Update peer progress. Commit and apply entries that reached quorum.
    // Candidate: discard
    // Follower: discard
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Leader: Transition to follower if applicable, otherwise reject.
    // Candidate: Transition to follower, then same as follower.
    // Follower: Buffer chunk. On the last chunk, restore state machine and reset log.
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<replica::InstallSnapshotOutput, replica::InstallSnapshotError>,
    ),

    // Leader: Advance peer's snapshot transfer.
    // Candidate: discard
    // Follower: discard
    InstallSnapshotReplyFromPeer(replica::InstallSnapshotReplyFromPeer),

    // Leader: Send AppendEntries (or the next snapshot chunk) to the peer.
    // Candidate: discard
    // Follower: discard
    LeaderTimer(replica::LeaderTimerTick),

    // Leader: discard
    // Candidate: Start a new election.
    // Follower: Transition to candidate, start election. Voters only.
    FollowerTimeout,

    // All: Reply with the voters in the latest config.
    GetServers(Callback<Vec<replica::ServerInfo>, ActorExited>),

    // Stop the event loop. Outstanding callbacks fail.
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Debug>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Debug> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[cfg(test)]
pub(crate) fn test_callback<O: Debug, E: Debug>() -> (Callback<O, E>, oneshot::Receiver<Result<O, E>>) {
    let (tx, rx) = oneshot::channel();
    (Callback(tx), rx)
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor exited")]
pub(crate) struct ActorExited;

/// ActorClient keeps the replica actor alive. The event loop ends once every ActorClient is dropped.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        (ActorClient { sender }, receiver)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn apply(
        &self,
        input: replica::ApplyInput,
    ) -> Result<replica::ApplyOutput, replica::ApplyError> {
        call(&self.sender, |cb| Event::Apply(input, cb), replica::ApplyError::ActorExited).await
    }

    pub(crate) async fn change_membership(
        &self,
        input: replica::ChangeMembershipInput,
    ) -> Result<replica::ChangeMembershipOutput, replica::ChangeMembershipError> {
        call(
            &self.sender,
            |cb| Event::ChangeMembership(input, cb),
            replica::ChangeMembershipError::ActorExited,
        )
        .await
    }

    pub(crate) async fn get_servers(&self) -> Result<Vec<replica::ServerInfo>, ActorExited> {
        call(&self.sender, Event::GetServers, ActorExited).await
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.sender.send(Event::Shutdown).await;
    }
}

/// WeakActorClient is held by everything the actor itself owns or spawns (timers, peer calls, the
/// RPC server), so that none of them keep it alive.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    fn sender(&self) -> Result<mpsc::Sender<Event>, ActorExited> {
        self.sender.upgrade().ok_or(ActorExited)
    }

    async fn notify(&self, event: Event) -> Result<(), ActorExited> {
        self.sender()?.send(event).await.map_err(|_| ActorExited)
    }

    pub(crate) async fn change_membership(
        &self,
        input: replica::ChangeMembershipInput,
    ) -> Result<replica::ChangeMembershipOutput, replica::ChangeMembershipError> {
        let sender = self
            .sender()
            .map_err(|_| replica::ChangeMembershipError::ActorExited)?;
        call(
            &sender,
            |cb| Event::ChangeMembership(input, cb),
            replica::ChangeMembershipError::ActorExited,
        )
        .await
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        let sender = self.sender().map_err(|_| replica::RequestVoteError::ActorExited)?;
        call(
            &sender,
            |cb| Event::RequestVote(input, cb),
            replica::RequestVoteError::ActorExited,
        )
        .await
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        let sender = self.sender().map_err(|_| replica::AppendEntriesError::ActorExited)?;
        call(
            &sender,
            |cb| Event::AppendEntries(input, cb),
            replica::AppendEntriesError::ActorExited,
        )
        .await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        let sender = self.sender().map_err(|_| replica::InstallSnapshotError::ActorExited)?;
        call(
            &sender,
            |cb| Event::InstallSnapshot(input, cb),
            replica::InstallSnapshotError::ActorExited,
        )
        .await
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        input: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.notify(Event::RequestVoteReplyFromPeer(input)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        input: replica::AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.notify(Event::AppendEntriesReplyFromPeer(input)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        input: replica::InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.notify(Event::InstallSnapshotReplyFromPeer(input)).await
    }

    pub(crate) async fn leader_timer(&self, input: replica::LeaderTimerTick) -> Result<(), ActorExited> {
        self.notify(Event::LeaderTimer(input)).await
    }

    pub(crate) async fn follower_timeout(&self) -> Result<(), ActorExited> {
        self.notify(Event::FollowerTimeout).await
    }
}

async fn call<O, E, F>(sender: &mpsc::Sender<Event>, to_event: F, exited: E) -> Result<O, E>
where
    O: Debug,
    E: Debug,
    F: FnOnce(Callback<O, E>) -> Event,
{
    let (tx, rx) = oneshot::channel();
    if sender.send(to_event(Callback(tx))).await.is_err() {
        return Err(exited);
    }
    match rx.await {
        Ok(result) => result,
        // Actor dropped the callback without answering, e.g. it shut down.
        Err(_) => Err(exited),
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L>
where
    L: commitlog::Log<replica::WriteAheadLogEntry>,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L>,
}

impl<L> ReplicaActor<L>
where
    L: commitlog::Log<replica::WriteAheadLogEntry> + 'static,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica<L>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if let Event::Shutdown = event {
                break;
            }
            self.handle_event(event);
        }

        self.replica.handle_shutdown();
        slog::info!(self.logger, "Replica event loop exited");
    }

    // This must NOT be async. Any long running work must be spawned on another actor
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Apply(input, callback) => {
                // Replica holds on to the callback until the entry is applied.
                self.replica.handle_apply(input, callback);
            }
            Event::ChangeMembership(input, callback) => {
                self.replica.handle_change_membership(input, callback);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(input) => {
                self.replica.handle_request_vote_reply_from_peer(input);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(input) => {
                self.replica.handle_append_entries_reply_from_peer(input);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.server_handle_install_snapshot(input);
                callback.send(result);
            }
            Event::InstallSnapshotReplyFromPeer(input) => {
                self.replica.handle_install_snapshot_reply_from_peer(input);
            }
            Event::LeaderTimer(input) => {
                self.replica.handle_leader_timer(input);
            }
            Event::FollowerTimeout => {
                self.replica.handle_follower_timeout();
            }
            Event::GetServers(callback) => {
                callback.send(Ok(self.replica.handle_get_servers()));
            }
            Event::Shutdown => {}
        }
    }
}
