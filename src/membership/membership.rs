use crate::membership::member_list::MemberList;
use crate::membership::message::{Message, MAX_DATAGRAM};
use crate::membership::{
    GossipOptions, HandlerError, Member, MemberEvent, MemberStatus, MembershipConfig, MembershipError,
    MembershipHandler,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration};

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Membership keeps this node in a SWIM-style gossip pool and reports other members joining and
/// leaving to a `MembershipHandler`.
///
/// Dropping it stops all background tasks without telling anyone. Call `leave()` first to depart
/// gracefully.
pub struct Membership {
    shared: Arc<Shared>,
    left: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Membership {
    /// Binds the gossip socket, starts the background tasks and joins through
    /// `config.start_join_addrs`, if any. Fails if none of the seeds answer.
    pub async fn new(
        config: MembershipConfig,
        handler: Arc<dyn MembershipHandler>,
    ) -> Result<Self, MembershipError> {
        config.options.validate()?;

        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| MembershipError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| MembershipError::Bind {
            addr: config.bind_addr,
            source,
        })?;

        let logger = config.logger.new(slog::o!("Member" => config.node_name.clone()));
        let local = Member {
            name: config.node_name,
            addr: local_addr,
            tags: config.tags,
            status: MemberStatus::Alive,
            incarnation: 0,
        };
        slog::info!(logger, "Gossiping on {}", local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            logger: logger.clone(),
            socket,
            members: Mutex::new(MemberList::new(local.clone(), config.options.retransmit_multiplier)),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(1),
            events: events_tx,
            options: config.options.clone(),
        });

        tokio::spawn(shared.clone().run_receive_loop(shutdown_rx.clone()));
        tokio::spawn(shared.clone().run_probe_loop(shutdown_rx.clone()));
        tokio::spawn(run_event_loop(
            logger,
            local.name,
            events_rx,
            handler,
            config.options.handler_timeout,
            shutdown_rx,
        ));

        let membership = Membership {
            shared,
            left: AtomicBool::new(false),
            shutdown_tx,
        };
        if !config.start_join_addrs.is_empty() {
            membership.join(&config.start_join_addrs).await?;
        }

        Ok(membership)
    }

    /// Contacts each seed and merges what it knows. Returns how many seeds answered.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize, MembershipError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(MembershipError::AlreadyLeft);
        }

        let mut joined = 0;
        for seed in seeds {
            let local = self.shared.members.lock().local().clone();
            let (seq, rx) = self.shared.register_waiter();
            if let Err(e) = self.shared.send(*seed, &Message::Join { seq, member: local }).await {
                self.shared.waiters.lock().remove(&seq);
                slog::warn!(self.shared.logger, "Failed to contact seed {}: {}", seed, e);
                continue;
            }

            match time::timeout(self.shared.options.join_timeout, rx).await {
                Ok(Ok(())) => joined += 1,
                _ => {
                    self.shared.waiters.lock().remove(&seq);
                    slog::warn!(self.shared.logger, "Seed {} didn't answer join", seed);
                }
            }
        }

        if joined == 0 {
            return Err(MembershipError::JoinFailed(seeds.to_vec()));
        }
        Ok(joined)
    }

    /// Announces our departure to every active member, then stops gossiping.
    pub async fn leave(&self) -> Result<(), MembershipError> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Err(MembershipError::AlreadyLeft);
        }

        let (me, peers) = {
            let mut members = self.shared.members.lock();
            let me = members.leave();
            (me, members.random_active(usize::MAX, &[]))
        };
        slog::info!(self.shared.logger, "Leaving gossip pool, telling {} members", peers.len());

        let _ = self.shared.events.send(MemberEvent::Leave(vec![me.clone()]));
        let message = Message::Announce { member: me };
        for peer in peers {
            if let Err(e) = self.shared.send(peer.addr, &message).await {
                slog::warn!(self.shared.logger, "Failed to announce leave to {}: {}", peer.name, e);
            }
        }

        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    pub fn local_member(&self) -> Member {
        self.shared.members.lock().local().clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.members.lock().local().addr
    }

    /// Every member we know of, including ourselves and those that left or failed.
    pub fn members(&self) -> Vec<Member> {
        self.shared.members.lock().members()
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

enum Waiter {
    // A probe or join we sent.
    Reply(oneshot::Sender<()>),
    // A probe we sent on someone else's behalf.
    Relay { requester: SocketAddr, seq: u64 },
}

struct Shared {
    logger: slog::Logger,
    socket: UdpSocket,
    members: Mutex<MemberList>,
    waiters: Arc<Mutex<HashMap<u64, Waiter>>>,
    next_seq: AtomicU64,
    events: mpsc::UnboundedSender<MemberEvent>,
    options: GossipOptions,
}

impl Shared {
    async fn send(&self, addr: SocketAddr, message: &Message) -> Result<(), MembershipError> {
        let bytes = message.encode()?;
        self.socket
            .send_to(&bytes, addr)
            .await
            .map_err(|source| MembershipError::Send { addr, source })?;
        Ok(())
    }

    fn register_waiter(&self) -> (u64, oneshot::Receiver<()>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(seq, Waiter::Reply(tx));
        (seq, rx)
    }

    fn local_name(&self) -> String {
        self.members.lock().local().name.clone()
    }

    fn gossip(&self) -> Vec<Member> {
        self.members.lock().take_gossip(self.options.max_gossip_per_message)
    }

    fn apply_updates(&self, updates: Vec<Member>) {
        let now = Instant::now();
        let mut events: Vec<MemberEvent> = Vec::new();
        {
            let mut members = self.members.lock();
            for update in updates {
                if let Some(event) = members.apply(update, now) {
                    let unmerged = match events.last_mut() {
                        Some(last) => last.try_merge(event),
                        None => Some(event),
                    };
                    events.extend(unmerged);
                }
            }
        }
        self.publish(events);
    }

    fn publish(&self, events: Vec<MemberEvent>) {
        for event in events {
            slog::info!(self.logger, "Member event {:?}", event);
            let _ = self.events.send(event);
        }
    }

    async fn run_receive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => match Message::decode(&buf[..len]) {
                        Ok(message) => self.handle_message(from, message).await,
                        Err(e) => slog::warn!(self.logger, "Dropping malformed datagram from {}: {}", from, e),
                    },
                    Err(e) => slog::warn!(self.logger, "Gossip receive failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        slog::debug!(self.logger, "Gossip receive loop exited");
    }

    async fn handle_message(&self, from: SocketAddr, message: Message) {
        let replies = match message {
            Message::Ping { seq, gossip, .. } => {
                self.apply_updates(gossip);
                vec![(
                    from,
                    Message::Ack {
                        seq,
                        from: self.local_name(),
                        gossip: self.gossip(),
                    },
                )]
            }
            Message::Ack { seq, from: acker, gossip } => {
                self.apply_updates(gossip);
                let waiter = self.waiters.lock().remove(&seq);
                match waiter {
                    Some(Waiter::Reply(tx)) => {
                        let _ = tx.send(());
                        vec![]
                    }
                    Some(Waiter::Relay { requester, seq }) => vec![(
                        requester,
                        Message::Ack {
                            seq,
                            from: acker,
                            gossip: self.gossip(),
                        },
                    )],
                    None => vec![],
                }
            }
            Message::PingReq { seq, target, gossip, .. } => {
                self.apply_updates(gossip);
                let relay_seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                self.waiters
                    .lock()
                    .insert(relay_seq, Waiter::Relay { requester: from, seq });
                self.expire_waiter_later(relay_seq);
                vec![(
                    target,
                    Message::Ping {
                        seq: relay_seq,
                        from: self.local_name(),
                        gossip: self.gossip(),
                    },
                )]
            }
            Message::Join { seq, member } => {
                slog::debug!(self.logger, "Join request from {}", member.name);
                self.apply_updates(vec![member.clone()]);
                let (members, others) = {
                    let members = self.members.lock();
                    (members.members(), members.random_active(usize::MAX, &[member.name.as_str()]))
                };
                let announce = Message::Announce { member };
                let mut replies = vec![(from, Message::JoinAck { seq, members })];
                replies.extend(others.into_iter().map(|other| (other.addr, announce.clone())));
                replies
            }
            Message::JoinAck { seq, members } => {
                self.apply_updates(members);
                if let Some(Waiter::Reply(tx)) = self.waiters.lock().remove(&seq) {
                    let _ = tx.send(());
                }
                vec![]
            }
            Message::Announce { member } => {
                self.apply_updates(vec![member]);
                vec![]
            }
        };

        for (addr, message) in replies {
            if let Err(e) = self.send(addr, &message).await {
                slog::debug!(self.logger, "Failed to send to {}: {}", addr, e);
            }
        }
    }

    fn expire_waiter_later(&self, seq: u64) {
        // Relay entries are only ever removed by an ack, which may never come.
        let timeout = self.options.probe_timeout;
        let waiters = Arc::downgrade(&self.waiters);
        tokio::spawn(async move {
            time::sleep(timeout).await;
            if let Some(waiters) = waiters.upgrade() {
                waiters.lock().remove(&seq);
            }
        });
    }

    async fn run_probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.probe_cycle() => {}
                _ = shutdown.changed() => break,
            }
        }
        slog::debug!(self.logger, "Gossip probe loop exited");
    }

    async fn probe_cycle(&self) {
        time::sleep(self.options.probe_interval).await;

        let failed = self
            .members
            .lock()
            .expire_suspects(self.options.suspicion_timeout, Instant::now());
        self.publish(failed.into_iter().collect());

        let target = self.members.lock().random_active(1, &[]).pop();
        let target = match target {
            Some(target) => target,
            None => return,
        };
        if self.probe(&target).await {
            return;
        }
        let suspected = self
            .members
            .lock()
            .suspect(&target.name, target.incarnation, Instant::now());
        if suspected {
            slog::info!(self.logger, "No ack from {}, suspecting it", target.name);
        }
    }

    /// Pings `target` directly, then through relays. True if anyone got an ack from it.
    async fn probe(&self, target: &Member) -> bool {
        let local_name = self.local_name();
        let (seq, mut rx) = self.register_waiter();

        let ping = Message::Ping {
            seq,
            from: local_name.clone(),
            gossip: self.gossip(),
        };
        if let Err(e) = self.send(target.addr, &ping).await {
            slog::debug!(self.logger, "Failed to ping {}: {}", target.name, e);
        }
        if let Ok(Ok(())) = time::timeout(self.options.probe_timeout, &mut rx).await {
            return true;
        }

        let relays = self
            .members
            .lock()
            .random_active(self.options.indirect_probes, &[target.name.as_str()]);
        for relay in relays {
            let ping_req = Message::PingReq {
                seq,
                from: local_name.clone(),
                target: target.addr,
                gossip: self.gossip(),
            };
            if let Err(e) = self.send(relay.addr, &ping_req).await {
                slog::debug!(self.logger, "Failed to ask {} to probe {}: {}", relay.name, target.name, e);
            }
        }

        let acked = matches!(time::timeout(self.options.probe_timeout, rx).await, Ok(Ok(())));
        self.waiters.lock().remove(&seq);
        acked
    }
}

/// Delivers events to `handler` one at a time, in order. Events about ourselves are skipped.
pub(super) async fn run_event_loop(
    logger: slog::Logger,
    local_name: String,
    mut events: mpsc::UnboundedReceiver<MemberEvent>,
    handler: Arc<dyn MembershipHandler>,
    handler_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let (members, change) = match event {
            MemberEvent::Join(members) => (members, Change::Join),
            MemberEvent::Leave(members) | MemberEvent::Failed(members) => (members, Change::Leave),
        };
        for member in members {
            if member.name == local_name {
                continue;
            }
            handle_member_change(&logger, handler.as_ref(), &member, change, handler_timeout).await;
        }
    }
    slog::debug!(logger, "Member event loop exited");
}

#[derive(Clone, Copy, Debug)]
enum Change {
    Join,
    Leave,
}

async fn handle_member_change(
    logger: &slog::Logger,
    handler: &dyn MembershipHandler,
    member: &Member,
    change: Change,
    handler_timeout: Duration,
) {
    let rpc_addr = member.rpc_addr().unwrap_or_default();
    if let Change::Join = change {
        if rpc_addr.is_empty() {
            slog::error!(logger, "Member {} has no rpc address, can't add it", member.name);
            return;
        }
    }

    let attempts = async {
        let mut backoff = RETRY_INITIAL_BACKOFF;
        loop {
            let result = match change {
                Change::Join => handler.join(&member.name, rpc_addr).await,
                Change::Leave => handler.leave(&member.name).await,
            };
            match result {
                Err(e) if e.is_retryable() => {
                    slog::debug!(logger, "Retrying {:?} of {} after {}", change, member.name, e);
                    time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
                }
                result => return result,
            }
        }
    };

    match time::timeout(handler_timeout, attempts).await {
        Ok(Ok(())) => {}
        Ok(Err(HandlerError::NotLeader)) => {
            slog::debug!(
                logger,
                "Not leader, skipping {:?} of {} ({})",
                change,
                member.name,
                rpc_addr
            );
        }
        Ok(Err(e)) => {
            slog::error!(
                logger,
                "Failed to {:?} {} ({}): {}",
                change,
                member.name,
                rpc_addr,
                e
            );
        }
        Err(_) => {
            slog::error!(
                logger,
                "Timed out after {:?} handling {:?} of {} ({})",
                handler_timeout,
                change,
                member.name,
                rpc_addr
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::RPC_ADDR_TAG;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[derive(Default)]
    struct RecordingHandler {
        members: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<String>>,
        // Joins of these fail this many times with ChangeInProgress first.
        busy: Mutex<HashMap<String, usize>>,
        not_leader: AtomicBool,
        // Leaves fail this many times with NoLeader first.
        leaderless: Mutex<usize>,
    }

    #[async_trait]
    impl MembershipHandler for RecordingHandler {
        async fn join(&self, name: &str, rpc_addr: &str) -> Result<(), HandlerError> {
            self.calls.lock().push(format!("join {}", name));
            if self.not_leader.load(Ordering::SeqCst) {
                return Err(HandlerError::NotLeader);
            }
            if let Some(remaining) = self.busy.lock().get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(HandlerError::from(StoreError::ChangeInProgress));
                }
            }
            self.members.lock().insert(name.to_string(), rpc_addr.to_string());
            Ok(())
        }

        async fn leave(&self, name: &str) -> Result<(), HandlerError> {
            self.calls.lock().push(format!("leave {}", name));
            {
                let mut leaderless = self.leaderless.lock();
                if *leaderless > 0 {
                    *leaderless -= 1;
                    return Err(HandlerError::from(StoreError::NoLeader));
                }
            }
            self.members.lock().remove(name);
            Ok(())
        }
    }

    fn member(name: &str) -> Member {
        let mut tags = HashMap::new();
        tags.insert(RPC_ADDR_TAG.to_string(), format!("{}:7000", name));
        Member {
            name: name.to_string(),
            addr: "127.0.0.1:9000".parse().unwrap(),
            tags,
            status: MemberStatus::Alive,
            incarnation: 0,
        }
    }

    async fn drive(events: Vec<MemberEvent>, handler: Arc<RecordingHandler>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        for event in events {
            tx.send(event).unwrap();
        }
        drop(tx);
        run_event_loop(
            logger(),
            String::from("me"),
            rx,
            handler,
            Duration::from_secs(5),
            shutdown_rx,
        )
        .await;
    }

    #[tokio::test]
    async fn self_is_skipped_and_the_batch_continues() {
        let handler = Arc::new(RecordingHandler::default());
        drive(
            vec![
                MemberEvent::Join(vec![member("a"), member("me"), member("b"), member("c")]),
                MemberEvent::Leave(vec![member("me"), member("a")]),
                MemberEvent::Failed(vec![member("b"), member("me")]),
            ],
            handler.clone(),
        )
        .await;

        assert_eq!(
            *handler.calls.lock(),
            vec!["join a", "join b", "join c", "leave a", "leave b"]
        );
        let members = handler.members.lock();
        assert_eq!(members.len(), 1);
        assert_eq!(members.get("c").map(String::as_str), Some("c:7000"));
    }

    #[tokio::test]
    async fn retryable_errors_are_retried() {
        let handler = Arc::new(RecordingHandler::default());
        handler.busy.lock().insert(String::from("a"), 2);
        drive(vec![MemberEvent::Join(vec![member("a")])], handler.clone()).await;

        assert_eq!(handler.calls.lock().len(), 3);
        assert!(handler.members.lock().contains_key("a"));
    }

    #[tokio::test]
    async fn failure_during_election_is_retried() {
        let handler = Arc::new(RecordingHandler::default());
        handler.members.lock().insert(String::from("a"), String::from("a:7000"));
        *handler.leaderless.lock() = 1;
        drive(vec![MemberEvent::Failed(vec![member("a")])], handler.clone()).await;

        assert_eq!(*handler.calls.lock(), vec!["leave a", "leave a"]);
        assert!(handler.members.lock().is_empty());
    }

    #[tokio::test]
    async fn not_leader_is_not_retried() {
        let handler = Arc::new(RecordingHandler::default());
        handler.not_leader.store(true, Ordering::SeqCst);
        drive(
            vec![MemberEvent::Join(vec![member("a"), member("b")])],
            handler.clone(),
        )
        .await;

        assert_eq!(*handler.calls.lock(), vec!["join a", "join b"]);
    }

    #[tokio::test]
    async fn member_without_rpc_addr_is_not_joined() {
        let handler = Arc::new(RecordingHandler::default());
        let mut untagged = member("a");
        untagged.tags.clear();
        drive(vec![MemberEvent::Join(vec![untagged, member("b")])], handler.clone()).await;

        assert_eq!(*handler.calls.lock(), vec!["join b"]);
    }

    fn config(name: &str, seeds: Vec<SocketAddr>) -> MembershipConfig {
        let mut tags = HashMap::new();
        tags.insert(RPC_ADDR_TAG.to_string(), format!("rpc-{}", name));
        MembershipConfig {
            node_name: name.to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            tags,
            start_join_addrs: seeds,
            options: GossipOptions {
                probe_interval: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(25),
                suspicion_timeout: Duration::from_millis(250),
                ..GossipOptions::default()
            },
            logger: logger(),
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn pool_converges_on_join_and_leave() {
        let handlers: Vec<Arc<RecordingHandler>> = (0..3).map(|_| Arc::new(RecordingHandler::default())).collect();
        let first = Membership::new(config("n0", vec![]), handlers[0].clone()).await.unwrap();
        let seed = first.local_addr();
        let second = Membership::new(config("n1", vec![seed]), handlers[1].clone()).await.unwrap();
        let third = Membership::new(config("n2", vec![seed]), handlers[2].clone()).await.unwrap();

        assert!(wait_until(|| handlers.iter().all(|h| h.members.lock().len() == 2)).await);
        assert_eq!(handlers[1].members.lock().get("n2").map(String::as_str), Some("rpc-n2"));

        first.leave().await.unwrap();
        assert!(matches!(first.leave().await, Err(MembershipError::AlreadyLeft)));

        assert!(wait_until(|| handlers[1..].iter().all(|h| !h.members.lock().contains_key("n0"))).await);
        for handler in &handlers[1..] {
            let leaves = handler.calls.lock().iter().filter(|c| *c == "leave n0").count();
            assert_eq!(leaves, 1);
        }
        let n0 = second.members().into_iter().find(|m| m.name == "n0").unwrap();
        assert_eq!(n0.status, MemberStatus::Left);
        drop(third);
    }

    #[tokio::test]
    async fn silent_member_is_declared_failed() {
        let handlers: Vec<Arc<RecordingHandler>> = (0..2).map(|_| Arc::new(RecordingHandler::default())).collect();
        let first = Membership::new(config("n0", vec![]), handlers[0].clone()).await.unwrap();
        let second = Membership::new(config("n1", vec![first.local_addr()]), handlers[1].clone())
            .await
            .unwrap();
        assert!(wait_until(|| handlers[0].members.lock().contains_key("n1")).await);

        // Drop without leaving, as if it crashed.
        drop(second);

        assert!(wait_until(|| !handlers[0].members.lock().contains_key("n1")).await);
        let n1 = first.members().into_iter().find(|m| m.name == "n1").unwrap();
        assert_eq!(n1.status, MemberStatus::Failed);
    }

    #[tokio::test]
    async fn join_fails_without_live_seed() {
        let handler = Arc::new(RecordingHandler::default());
        // Nothing listens here once the socket is dropped.
        let dead = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let result = Membership::new(config("lonely", vec![dead]), handler).await;
        assert!(matches!(result, Err(MembershipError::JoinFailed(_))));
    }
}
