//! Session router
//!
//! [`Router`] is the signaling state machine. It does no IO: callers feed it
//! [`Input`]s and drain [`Output`]s until it reports a timeout, the same way a
//! sans-IO protocol engine is driven. [`spawn`] wraps it in a single actor
//! task so every transition is serialized.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::model::channel::{ChannelHandle, ChannelId};
use crate::model::message::{decode, ClientMessage, Decoded, Role, ServerMessage};
use crate::model::session::{Session, SessionState};
use crate::status::StatusBoard;

/// Something that happened to the relay.
#[derive(Debug)]
pub enum Input<'a> {
    /// A channel connected.
    Open(ChannelId),
    /// A channel sent a frame.
    Receive(ChannelId, &'a [u8]),
    /// A channel went away at the given instant.
    Close(Instant, ChannelId),
    /// Time moved forward.
    Timeout(Instant),
    /// Send a message to every open channel without touching the session.
    Broadcast(ServerMessage),
}

/// Something the router wants done.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Transmit(ChannelId, ServerMessage),
    /// Nothing more to send. Feed `Input::Timeout` once the deadline (if any)
    /// passes.
    Timeout(Option<Instant>),
}

/// Point-in-time view of the router, for the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub viewer: Option<u64>,
    pub source: Option<u64>,
    pub channels: usize,
    pub reset_pending: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionSnapshot {
            state: SessionState::Empty,
            viewer: None,
            source: None,
            channels: 0,
            reset_pending: false,
        }
    }
}

#[derive(Debug)]
pub struct Router {
    session: Session,
    channels: BTreeSet<ChannelId>,
    grace: Duration,
    queue: VecDeque<(ChannelId, ServerMessage)>,
}

impl Router {
    pub fn new(grace: Duration) -> Router {
        Router {
            session: Session::new(),
            channels: BTreeSet::new(),
            grace,
            queue: VecDeque::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.session.state(),
            viewer: self.session.bound(Role::Viewer).map(|id| *id),
            source: self.session.bound(Role::Source).map(|id| *id),
            channels: self.channels.len(),
            reset_pending: self.session.reset_deadline().is_some(),
        }
    }

    pub fn handle_input(&mut self, input: Input) {
        match input {
            Input::Open(id) => {
                self.channels.insert(id);
                debug!("Channel {} open ({} connected)", id, self.channels.len());
            }
            Input::Receive(id, bytes) => self.handle_receive(id, bytes),
            Input::Close(now, id) => self.handle_close(now, id),
            Input::Timeout(now) => self.handle_timeout(now),
            Input::Broadcast(message) => {
                let recipients: Vec<ChannelId> = self.channels.iter().copied().collect();
                for id in recipients {
                    self.transmit(id, message.clone());
                }
            }
        }
    }

    pub fn poll_output(&mut self) -> Output {
        match self.queue.pop_front() {
            Some((id, message)) => Output::Transmit(id, message),
            None => Output::Timeout(self.session.reset_deadline()),
        }
    }

    fn transmit(&mut self, id: ChannelId, message: ServerMessage) {
        self.queue.push_back((id, message));
    }

    fn handle_receive(&mut self, id: ChannelId, bytes: &[u8]) {
        if !self.channels.contains(&id) {
            debug!("Ignoring frame from unknown channel {}", id);
            return;
        }

        match decode(bytes) {
            Ok(Decoded::Message(message)) => self.dispatch(id, message),
            Ok(Decoded::Ignored(kind)) => {
                debug!("Channel {} sent unhandled kind {:?}", id, kind);
            }
            Err(e) => {
                warn!("Channel {} sent a malformed message: {}", id, e);
                self.transmit(
                    id,
                    ServerMessage::Error {
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    fn dispatch(&mut self, id: ChannelId, message: ClientMessage) {
        match message {
            ClientMessage::RoleRegister { role } => self.register(id, role),
            ClientMessage::Offer { payload } => {
                self.route_description(id, Role::Source, ServerMessage::Offer { payload })
            }
            ClientMessage::Answer { payload } => {
                self.route_description(id, Role::Viewer, ServerMessage::Answer { payload })
            }
            ClientMessage::Candidate { payload } => self.route_candidate(id, payload),
            ClientMessage::SessionReset => self.reset_requested(id),
        }
    }

    fn register(&mut self, id: ChannelId, role: Role) {
        self.bind(id, role);
        info!(
            "Channel {} registered as {} (session {:?})",
            id,
            role,
            self.session.state()
        );

        let message = ServerMessage::RoleRegistered {
            role,
            viewer_bound: self.session.bound(Role::Viewer).is_some(),
            source_bound: self.session.bound(Role::Source).is_some(),
        };
        self.transmit(id, message);
    }

    /// Bind `id` to `role`.
    ///
    /// Filling an empty slot counts as the departed role coming back and
    /// calls off a pending reset. A channel refreshing the role it already
    /// holds, or swapping roles, does not.
    fn bind(&mut self, id: ChannelId, role: Role) {
        let binding = self.session.bind(role, id);
        if let Some(previous) = binding.evicted {
            warn!("Channel {} took the {} role from channel {}", id, role, previous);
        }
        if let Some(released) = binding.released {
            info!("Channel {} gave up the {} role to become {}", id, released, role);
        }
        let returned = binding.filled && binding.released.is_none();
        if returned && self.session.cancel_reset().is_some() {
            info!("Pending session reset cancelled by channel {}", id);
        }
    }

    /// Route an offer (sent by a would-be source) or an answer (sent by a
    /// would-be viewer) to the opposite role.
    fn route_description(&mut self, id: ChannelId, sender_role: Role, message: ServerMessage) {
        match self.session.bound(sender_role.peer()) {
            Some(target) if target == id => {
                self.busy(id, &message, "sender holds the receiving role");
            }
            Some(target) => {
                // Last writer wins: a client reconnecting on a fresh socket
                // takes the role over from its stale one.
                self.bind(id, sender_role);
                debug!("Forwarding {} from {} to {}", message.kind(), id, target);
                self.transmit(target, message);
            }
            None => {
                self.bind(id, sender_role);
                debug!(
                    "No {} bound, broadcasting {} from {}",
                    sender_role.peer(),
                    message.kind(),
                    id
                );
                self.fallback_broadcast(id, message);
            }
        }
    }

    fn route_candidate(&mut self, id: ChannelId, payload: Value) {
        let message = ServerMessage::Candidate { payload };
        let target = self
            .session
            .role_of(id)
            .and_then(|role| self.session.bound(role.peer()));

        match target {
            Some(target) => {
                debug!("Forwarding candidate from {} to {}", id, target);
                self.transmit(target, message);
            }
            None => self.fallback_broadcast(id, message),
        }
    }

    fn reset_requested(&mut self, id: ChannelId) {
        info!("Channel {} requested a session reset", id);
        self.session.clear();
        self.session.cancel_reset();
        self.broadcast_except(id, ServerMessage::SessionReset);
    }

    fn busy(&mut self, id: ChannelId, message: &ServerMessage, reason: &str) {
        warn!(
            "Refusing {} from channel {}: {} (session {:?})",
            message.kind(),
            id,
            reason,
            self.session.state()
        );
        self.transmit(id, ServerMessage::SessionBusy);
    }

    /// Broadcast used when there is no clear peer to route to.
    ///
    /// With more than two clients connected this reaches channels that are
    /// not part of the pairing.
    fn fallback_broadcast(&mut self, origin: ChannelId, message: ServerMessage) {
        let recipients = self.channels.len().saturating_sub(1);
        if recipients > 1 {
            warn!(
                "Broadcasting {} from {} to {} channels, some outside the pairing",
                message.kind(),
                origin,
                recipients
            );
        }
        self.broadcast_except(origin, message);
    }

    fn broadcast_except(&mut self, origin: ChannelId, message: ServerMessage) {
        let recipients: Vec<ChannelId> = self
            .channels
            .iter()
            .copied()
            .filter(|id| *id != origin)
            .collect();
        for id in recipients {
            self.transmit(id, message.clone());
        }
    }

    fn handle_close(&mut self, now: Instant, id: ChannelId) {
        if !self.channels.remove(&id) {
            return;
        }

        let Some(role) = self.session.release(id) else {
            debug!("Unbound channel {} closed", id);
            return;
        };

        let deadline = now + self.grace;
        if self.session.arm_reset(deadline).is_some() {
            info!(
                "{} channel {} left, session reset re-armed for {:?}",
                role, id, self.grace
            );
        } else {
            info!(
                "{} channel {} left, session reset in {:?} unless the role is taken again",
                role, id, self.grace
            );
        }
    }

    fn handle_timeout(&mut self, now: Instant) {
        if self.session.take_expired_reset(now).is_none() {
            return;
        }

        info!(
            "Grace period over, resetting session for {} channel(s)",
            self.channels.len()
        );
        self.session.clear();
        let recipients: Vec<ChannelId> = self.channels.iter().copied().collect();
        for id in recipients {
            self.transmit(id, ServerMessage::SessionReset);
        }
    }
}

enum Event {
    Open(ChannelHandle),
    Receive(ChannelId, Vec<u8>),
    Close(ChannelId),
    Broadcast(ServerMessage),
    Shutdown,
}

/// Cheap, cloneable way to talk to the router task.
#[derive(Clone)]
pub struct RouterHandle {
    tx: UnboundedSender<Event>,
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl RouterHandle {
    fn submit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("Router task is gone, dropping event");
        }
    }

    pub fn open(&self, channel: ChannelHandle) {
        self.submit(Event::Open(channel));
    }

    pub fn receive(&self, id: ChannelId, bytes: Vec<u8>) {
        self.submit(Event::Receive(id, bytes));
    }

    pub fn close(&self, id: ChannelId) {
        self.submit(Event::Close(id));
    }

    pub fn broadcast(&self, message: ServerMessage) {
        self.submit(Event::Broadcast(message));
    }

    /// Close every open channel and stop the router task.
    pub fn shutdown(&self) {
        self.submit(Event::Shutdown);
    }
}

/// Start the router task. It runs until shut down or until every
/// [`RouterHandle`] is dropped.
pub fn spawn(grace: Duration, board: StatusBoard) -> (RouterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(Router::new(grace), rx, board));
    (RouterHandle { tx }, task)
}

async fn run(mut router: Router, mut rx: UnboundedReceiver<Event>, board: StatusBoard) {
    let mut channels: HashMap<ChannelId, ChannelHandle> = HashMap::new();

    loop {
        board.publish_session(router.snapshot());
        let timeout = transmit_until_timeout(&mut router, &channels);

        let event = match timeout {
            Some(deadline) => match time::timeout_at(deadline.into(), rx.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    router.handle_input(Input::Timeout(Instant::now()));
                    continue;
                }
            },
            None => rx.recv().await,
        };

        let Some(event) = event else {
            break;
        };

        match event {
            Event::Open(channel) => {
                let id = channel.id();
                channels.insert(id, channel);
                router.handle_input(Input::Open(id));
            }
            Event::Receive(id, bytes) => router.handle_input(Input::Receive(id, &bytes)),
            Event::Close(id) => {
                channels.remove(&id);
                router.handle_input(Input::Close(Instant::now(), id));
            }
            Event::Broadcast(message) => router.handle_input(Input::Broadcast(message)),
            Event::Shutdown => {
                info!("Closing {} channel(s)", channels.len());
                for channel in channels.values() {
                    if let Err(e) = channel.close() {
                        debug!("{}", e);
                    }
                }
                break;
            }
        }
    }

    info!("Router stopped");
}

/// Hand every queued message to its channel, then return the next deadline.
fn transmit_until_timeout(
    router: &mut Router,
    channels: &HashMap<ChannelId, ChannelHandle>,
) -> Option<Instant> {
    loop {
        match router.poll_output() {
            Output::Transmit(id, message) => match channels.get(&id) {
                Some(channel) => {
                    if let Err(e) = channel.send(&message) {
                        debug!("Dropping {}: {}", message.kind(), e);
                    }
                }
                None => debug!("Dropping {} for departed channel {}", message.kind(), id),
            },
            Output::Timeout(deadline) => return deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::channel::Outgoing;
    use serde_json::json;

    const GRACE: Duration = Duration::from_secs(3);

    struct Harness {
        router: Router,
        start: Instant,
    }

    impl Harness {
        fn new() -> Harness {
            Harness {
                router: Router::new(GRACE),
                start: Instant::now(),
            }
        }

        fn at(&self, millis: u64) -> Instant {
            self.start + Duration::from_millis(millis)
        }

        fn open(&mut self, n: u64) -> ChannelId {
            let id = ChannelId::from_raw(n);
            self.router.handle_input(Input::Open(id));
            id
        }

        fn send(&mut self, id: ChannelId, value: serde_json::Value) {
            let raw = value.to_string();
            self.router.handle_input(Input::Receive(id, raw.as_bytes()));
        }

        fn register(&mut self, id: ChannelId, role: &str) {
            self.send(id, json!({"kind": "role-register", "role": role}));
        }

        fn close(&mut self, id: ChannelId, millis: u64) {
            let now = self.at(millis);
            self.router.handle_input(Input::Close(now, id));
        }

        fn tick(&mut self, millis: u64) {
            let now = self.at(millis);
            self.router.handle_input(Input::Timeout(now));
        }

        /// Drain everything queued, returning the transmits.
        fn drain(&mut self) -> Vec<(ChannelId, ServerMessage)> {
            let mut out = vec![];
            while let Output::Transmit(id, message) = self.router.poll_output() {
                out.push((id, message));
            }
            out
        }

        fn deadline(&mut self) -> Option<Instant> {
            match self.router.poll_output() {
                Output::Timeout(deadline) => deadline,
                other => panic!("unexpected output {:?}", other),
            }
        }
    }

    fn resets(out: &[(ChannelId, ServerMessage)]) -> usize {
        out.iter()
            .filter(|(_, m)| *m == ServerMessage::SessionReset)
            .count()
    }

    #[test]
    fn registration_replies_with_bindings() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);

        h.register(a, "source");
        assert_eq!(
            h.drain(),
            vec![(
                a,
                ServerMessage::RoleRegistered {
                    role: Role::Source,
                    viewer_bound: false,
                    source_bound: true,
                }
            )]
        );

        h.register(b, "viewer");
        assert_eq!(
            h.drain(),
            vec![(
                b,
                ServerMessage::RoleRegistered {
                    role: Role::Viewer,
                    viewer_bound: true,
                    source_bound: true,
                }
            )]
        );
        assert_eq!(h.router.session().state(), SessionState::Paired);
    }

    #[test]
    fn second_registration_evicts_first_holder() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);

        h.register(a, "viewer");
        h.register(b, "viewer");
        h.drain();

        assert_eq!(h.router.session().bound(Role::Viewer), Some(b));
        assert_eq!(h.router.session().role_of(a), None);
    }

    #[test]
    fn offer_and_answer_are_forwarded_verbatim() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.register(a, "source");
        h.register(b, "viewer");
        h.drain();

        h.send(a, json!({"kind": "offer", "payload": {"sdp": "x"}}));
        assert_eq!(
            h.drain(),
            vec![(b, ServerMessage::Offer { payload: json!({"sdp": "x"}) })]
        );

        h.send(b, json!({"kind": "answer", "payload": {"sdp": "y"}}));
        assert_eq!(
            h.drain(),
            vec![(a, ServerMessage::Answer { payload: json!({"sdp": "y"}) })]
        );
    }

    #[test]
    fn lone_offer_binds_source_and_reaches_nobody() {
        let mut h = Harness::new();
        let a = h.open(1);

        h.send(a, json!({"kind": "offer", "payload": {"sdp": "x"}}));
        assert!(h.drain().is_empty());
        assert_eq!(h.router.session().bound(Role::Source), Some(a));
    }

    #[test]
    fn offer_without_viewer_is_broadcast_to_others() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);

        h.send(a, json!({"kind": "offer", "payload": "x"}));
        assert_eq!(
            h.drain(),
            vec![(b, ServerMessage::Offer { payload: json!("x") })]
        );
        assert_eq!(h.router.session().bound(Role::Source), Some(a));

        // A new source refreshes the binding while no viewer exists.
        h.send(b, json!({"kind": "offer", "payload": "z"}));
        assert_eq!(
            h.drain(),
            vec![(a, ServerMessage::Offer { payload: json!("z") })]
        );
        assert_eq!(h.router.session().bound(Role::Source), Some(b));
    }

    #[test]
    fn offer_to_registered_viewer_binds_sender_as_source() {
        let mut h = Harness::new();
        let viewer = h.open(1);
        let phone = h.open(2);
        h.register(viewer, "viewer");
        h.drain();

        h.send(phone, json!({"kind": "offer", "payload": "x"}));
        assert_eq!(
            h.drain(),
            vec![(viewer, ServerMessage::Offer { payload: json!("x") })]
        );
        assert_eq!(h.router.session().bound(Role::Source), Some(phone));
    }

    #[test]
    fn offer_from_viewer_is_refused() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.register(a, "viewer");
        h.register(b, "source");
        h.drain();

        h.send(a, json!({"kind": "offer", "payload": "x"}));
        assert_eq!(h.drain(), vec![(a, ServerMessage::SessionBusy)]);
        assert_eq!(h.router.session().bound(Role::Viewer), Some(a));
        assert_eq!(h.router.session().bound(Role::Source), Some(b));
    }

    #[test]
    fn fresh_channel_offering_to_a_pair_takes_over_the_source() {
        let mut h = Harness::new();
        let viewer = h.open(1);
        let stale = h.open(2);
        let fresh = h.open(3);
        h.register(viewer, "viewer");
        h.register(stale, "source");
        h.drain();

        h.send(fresh, json!({"kind": "offer", "payload": "x"}));
        assert_eq!(
            h.drain(),
            vec![(viewer, ServerMessage::Offer { payload: json!("x") })]
        );
        assert_eq!(h.router.session().bound(Role::Source), Some(fresh));
        assert_eq!(h.router.session().role_of(stale), None);
        assert_eq!(h.router.session().state(), SessionState::Paired);
    }

    #[test]
    fn fresh_channel_answering_a_pair_takes_over_the_viewer() {
        let mut h = Harness::new();
        let stale = h.open(1);
        let source = h.open(2);
        let fresh = h.open(3);
        h.register(stale, "viewer");
        h.register(source, "source");
        h.drain();

        h.send(fresh, json!({"kind": "answer", "payload": "y"}));
        assert_eq!(
            h.drain(),
            vec![(source, ServerMessage::Answer { payload: json!("y") })]
        );
        assert_eq!(h.router.session().bound(Role::Viewer), Some(fresh));
        assert_eq!(h.router.session().role_of(stale), None);
    }

    #[test]
    fn answer_mirrors_offer_routing() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);

        // Nothing bound: answer binds the viewer and is broadcast.
        h.send(b, json!({"kind": "answer", "payload": "y"}));
        assert_eq!(
            h.drain(),
            vec![(a, ServerMessage::Answer { payload: json!("y") })]
        );
        assert_eq!(h.router.session().bound(Role::Viewer), Some(b));

        // Answer from the source is refused.
        h.register(a, "source");
        h.drain();
        h.send(a, json!({"kind": "answer", "payload": "y"}));
        assert_eq!(h.drain(), vec![(a, ServerMessage::SessionBusy)]);
    }

    #[test]
    fn answer_to_bound_source_binds_viewer() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.register(a, "source");
        h.drain();

        h.send(b, json!({"kind": "answer", "payload": "y"}));
        assert_eq!(
            h.drain(),
            vec![(a, ServerMessage::Answer { payload: json!("y") })]
        );
        assert_eq!(h.router.session().bound(Role::Viewer), Some(b));
    }

    #[test]
    fn candidates_follow_roles() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.register(a, "source");
        h.register(b, "viewer");
        h.drain();

        h.send(a, json!({"kind": "candidate", "payload": {"candidate": "c1"}}));
        h.send(b, json!({"kind": "candidate", "payload": {"candidate": "c2"}}));
        assert_eq!(
            h.drain(),
            vec![
                (b, ServerMessage::Candidate { payload: json!({"candidate": "c1"}) }),
                (a, ServerMessage::Candidate { payload: json!({"candidate": "c2"}) }),
            ]
        );
    }

    #[test]
    fn unregistered_candidate_is_broadcast_to_all_others() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        let c = h.open(3);

        h.send(a, json!({"kind": "candidate", "payload": "c"}));
        assert_eq!(
            h.drain(),
            vec![
                (b, ServerMessage::Candidate { payload: json!("c") }),
                (c, ServerMessage::Candidate { payload: json!("c") }),
            ]
        );
    }

    #[test]
    fn candidate_without_bound_peer_is_broadcast() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.register(a, "source");
        h.drain();

        h.send(a, json!({"kind": "candidate", "payload": "c"}));
        assert_eq!(
            h.drain(),
            vec![(b, ServerMessage::Candidate { payload: json!("c") })]
        );
    }

    #[test]
    fn malformed_message_is_answered_to_sender_only() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.register(a, "source");
        h.register(b, "viewer");
        h.drain();

        h.router.handle_input(Input::Receive(a, b"{oops"));
        h.send(a, json!({"kind": "offer"}));
        let out = h.drain();
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|(id, m)| *id == a && matches!(m, ServerMessage::Error { .. })));

        // The channel keeps working afterwards.
        h.send(a, json!({"kind": "offer", "payload": "x"}));
        assert_eq!(
            h.drain(),
            vec![(b, ServerMessage::Offer { payload: json!("x") })]
        );
    }

    #[test]
    fn unknown_kinds_produce_nothing() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.open(2);
        h.send(a, json!({"kind": "stats", "fps": 24}));
        assert!(h.drain().is_empty());
    }

    #[test]
    fn reregistering_within_grace_suppresses_reset() {
        let mut h = Harness::new();
        let viewer = h.open(1);
        let source = h.open(2);
        h.register(viewer, "viewer");
        h.register(source, "source");
        h.drain();

        h.close(source, 0);
        assert_eq!(h.router.session().bound(Role::Source), None);
        assert_eq!(h.deadline(), Some(h.at(3000)));

        let again = h.open(3);
        h.tick(1000);
        h.register(again, "source");
        h.drain();
        assert_eq!(h.deadline(), None);

        h.tick(5000);
        assert_eq!(resets(&h.drain()), 0);
        assert_eq!(h.router.session().state(), SessionState::Paired);
    }

    #[test]
    fn survivor_offering_again_does_not_cancel_the_reset() {
        let mut h = Harness::new();
        let viewer = h.open(1);
        let source = h.open(2);
        h.register(viewer, "viewer");
        h.register(source, "source");
        h.drain();

        h.close(viewer, 0);
        h.tick(1000);
        h.send(source, json!({"kind": "offer", "payload": "retry"}));
        assert_eq!(h.deadline(), Some(h.at(3000)));

        h.tick(4000);
        h.tick(10_000);
        let out = h.drain();
        assert_eq!(resets(&out), 1);
        assert_eq!(out.last(), Some(&(source, ServerMessage::SessionReset)));
        assert_eq!(h.router.session().state(), SessionState::Empty);
    }

    #[test]
    fn survivor_reregistering_does_not_cancel_the_reset() {
        let mut h = Harness::new();
        let viewer = h.open(1);
        let source = h.open(2);
        h.register(viewer, "viewer");
        h.register(source, "source");
        h.drain();

        h.close(source, 0);
        h.register(viewer, "viewer");
        h.drain();
        assert_eq!(h.deadline(), Some(h.at(3000)));

        h.tick(3000);
        assert_eq!(h.drain(), vec![(viewer, ServerMessage::SessionReset)]);
    }

    #[test]
    fn survivor_swapping_roles_does_not_cancel_the_reset() {
        let mut h = Harness::new();
        let viewer = h.open(1);
        let source = h.open(2);
        h.register(viewer, "viewer");
        h.register(source, "source");
        h.drain();

        h.close(source, 0);
        h.register(viewer, "source");
        h.drain();
        assert_eq!(h.deadline(), Some(h.at(3000)));

        h.tick(3000);
        assert_eq!(h.drain(), vec![(viewer, ServerMessage::SessionReset)]);
    }

    #[test]
    fn grace_expiry_resets_exactly_once() {
        let mut h = Harness::new();
        let viewer = h.open(1);
        let source = h.open(2);
        h.register(viewer, "viewer");
        h.register(source, "source");
        h.drain();

        h.close(source, 0);
        h.tick(2999);
        assert!(h.drain().is_empty());

        h.tick(3000);
        assert_eq!(h.drain(), vec![(viewer, ServerMessage::SessionReset)]);
        assert_eq!(h.router.session().state(), SessionState::Empty);

        h.tick(6000);
        assert!(h.drain().is_empty());
        assert_eq!(h.deadline(), None);
    }

    #[test]
    fn simultaneous_disconnects_share_one_timer() {
        let mut h = Harness::new();
        let viewer = h.open(1);
        let source = h.open(2);
        let bystander = h.open(3);
        h.register(viewer, "viewer");
        h.register(source, "source");
        h.drain();

        h.close(viewer, 0);
        h.close(source, 10);
        assert_eq!(h.deadline(), Some(h.at(3010)));

        h.tick(3000);
        assert!(h.drain().is_empty());
        h.tick(3010);
        h.tick(9000);
        assert_eq!(h.drain(), vec![(bystander, ServerMessage::SessionReset)]);
    }

    #[test]
    fn unbound_disconnect_arms_nothing() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.register(a, "viewer");
        h.drain();

        h.close(b, 0);
        assert_eq!(h.deadline(), None);
        // Closing twice is harmless.
        h.close(b, 5);
        assert_eq!(h.deadline(), None);
    }

    #[test]
    fn explicit_reset_notifies_everyone_but_requester() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        let c = h.open(3);
        h.register(a, "viewer");
        h.register(b, "source");
        h.close(c, 0);
        let d = h.open(4);
        h.drain();

        // A disconnect of an unbound channel armed nothing; arm one for real.
        h.close(b, 0);
        assert!(h.deadline().is_some());

        h.send(a, json!({"kind": "session-reset"}));
        assert_eq!(h.drain(), vec![(d, ServerMessage::SessionReset)]);
        assert_eq!(h.router.session().state(), SessionState::Empty);
        assert_eq!(h.deadline(), None);

        h.tick(10_000);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn broadcast_reaches_every_channel_and_leaves_roles_alone() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.register(a, "viewer");
        h.drain();

        let changed = ServerMessage::IpChanged {
            new_address: "192.168.1.20".into(),
        };
        h.router.handle_input(Input::Broadcast(changed.clone()));
        assert_eq!(h.drain(), vec![(a, changed.clone()), (b, changed)]);
        assert_eq!(h.router.session().state(), SessionState::ViewerOnly);
    }

    #[test]
    fn snapshot_reports_bindings() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.open(2);
        h.register(a, "source");
        h.drain();

        assert_eq!(
            h.router.snapshot(),
            SessionSnapshot {
                state: SessionState::SourceOnly,
                viewer: None,
                source: Some(1),
                channels: 2,
                reset_pending: false,
            }
        );
    }

    #[tokio::test]
    async fn actor_routes_between_channels() {
        let board = StatusBoard::default();
        let (router, task) = spawn(Duration::from_millis(50), board.clone());

        let (a, mut a_rx) = ChannelHandle::new(ChannelId::next());
        let (b, mut b_rx) = ChannelHandle::new(ChannelId::next());
        let (a_id, b_id) = (a.id(), b.id());
        router.open(a);
        router.open(b);

        router.receive(a_id, br#"{"kind":"role-register","role":"source"}"#.to_vec());
        router.receive(b_id, br#"{"kind":"role-register","role":"viewer"}"#.to_vec());
        router.receive(a_id, br#"{"kind":"offer","payload":{"sdp":"x"}}"#.to_vec());

        let _registered = a_rx.recv().await.unwrap();
        let _registered = b_rx.recv().await.unwrap();
        let offer = b_rx.recv().await.unwrap();
        assert_eq!(
            offer,
            Outgoing::Text(r#"{"kind":"offer","payload":{"sdp":"x"}}"#.into())
        );

        // Source leaves; after the grace period the viewer is told to reset.
        router.close(a_id);
        let reset = b_rx.recv().await.unwrap();
        assert_eq!(
            reset,
            Outgoing::Text(r#"{"kind":"session-reset"}"#.into())
        );
        assert_eq!(board.session().state, SessionState::Empty);

        drop(router);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn actor_shutdown_closes_every_channel() {
        let (router, task) = spawn(Duration::from_secs(3), StatusBoard::default());

        let (a, mut a_rx) = ChannelHandle::new(ChannelId::next());
        let (b, mut b_rx) = ChannelHandle::new(ChannelId::next());
        let a_id = a.id();
        router.open(a);
        router.open(b);
        router.receive(a_id, br#"{"kind":"role-register","role":"viewer"}"#.to_vec());

        router.shutdown();
        task.await.unwrap();

        assert!(matches!(a_rx.recv().await, Some(Outgoing::Text(_))));
        assert_eq!(a_rx.recv().await, Some(Outgoing::Close));
        assert_eq!(b_rx.recv().await, Some(Outgoing::Close));
        // The task dropped its handles on the way out.
        assert_eq!(b_rx.recv().await, None);

        // Late events are dropped quietly.
        router.broadcast(ServerMessage::SessionReset);
    }
}
