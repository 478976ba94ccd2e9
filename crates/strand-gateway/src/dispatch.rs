use serde_json::Value;
use strand_models::gateway::*;

use crate::bootstrap::{BootstrapStep, BootstrapTracker};
use crate::events::DispatchEvent;

/// How a bootstrap finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// First READY of this client.
    Ready,
    /// READY after a fresh identify on a client that was ready before.
    Reconnected,
    Resumed,
}

/// Side effects the connection loop applies after a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Deliver(DispatchEvent),
    SessionStarted { session_id: String },
    /// RESUMED arrived; queued sends may flow.
    Authorized,
    /// Member chunk or guild sync request for the priority queue.
    Request(GatewayMessage),
    BootstrapComplete(Completion),
}

/// Routes dispatch payloads and holds back events that arrive while the
/// session is still bootstrapping.
#[derive(Debug)]
pub struct Dispatcher {
    initiating: bool,
    processing_ready: bool,
    ready_seen: bool,
    guild_sync: bool,
    buffered: Vec<GatewayMessage>,
    tracker: BootstrapTracker,
}

impl Dispatcher {
    pub fn new(guild_sync: bool) -> Self {
        Self {
            initiating: true,
            processing_ready: false,
            ready_seen: false,
            guild_sync,
            buffered: Vec::new(),
            tracker: BootstrapTracker::new(),
        }
    }

    /// A new connection starts bootstrapping again.
    pub fn begin_connection(&mut self) {
        self.initiating = true;
    }

    pub fn is_initiating(&self) -> bool {
        self.initiating
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// The session is gone; held events and bootstrap progress go with it.
    pub fn invalidate(&mut self) {
        self.tracker.clear();
        self.buffered.clear();
        self.processing_ready = false;
    }

    /// Handle one DISPATCH payload. `sequence` is the session cursor after
    /// this payload was read.
    pub fn handle(&mut self, message: GatewayMessage, sequence: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.route(message, sequence, &mut effects);
        effects
    }

    fn route(&mut self, message: GatewayMessage, sequence: u64, effects: &mut Vec<Effect>) {
        let Some(event_type) = message.t.clone() else {
            tracing::debug!("dispatch without event type dropped");
            return;
        };

        if self.initiating
            && (event_type == EVENT_GUILD_MEMBER_ADD || event_type == EVENT_GUILD_MEMBER_REMOVE)
        {
            if let Ok(delta) = message.body::<GuildMemberDelta>() {
                let change = if event_type == EVENT_GUILD_MEMBER_ADD { 1 } else { -1 };
                let step = self.tracker.adjust_expected(delta.guild_id, change);
                self.apply_step(step, sequence, effects);
            }
        }

        match message.d.as_ref() {
            Some(Value::Object(_)) => {}
            Some(Value::Array(items)) if event_type == EVENT_PRESENCES_REPLACE => {
                for item in items.clone() {
                    let presence = GatewayMessage::dispatch(EVENT_PRESENCE_UPDATE, message.s, item);
                    self.route(presence, sequence, effects);
                }
                return;
            }
            _ => {
                tracing::debug!(event_type = %event_type, "dispatch body is not an object; dropped");
                return;
            }
        }

        if self.initiating && !self.passes_barrier(&event_type) {
            if event_type == EVENT_GUILD_DELETE && !self.tracker.requests_sent() {
                if let Ok(deleted) = message.body::<GuildDelete>() {
                    if deleted.unavailable && self.tracker.is_tracking(deleted.id) {
                        let step = self.tracker.acknowledge(deleted.id, false, None, false);
                        self.apply_step(step, sequence, effects);
                        return;
                    }
                }
            }
            self.buffered.push(message);
            return;
        }

        match event_type.as_str() {
            EVENT_READY => self.on_ready(message, sequence, effects),
            EVENT_RESUMED => {
                if let Ok(resumed) = message.body::<Resumed>() {
                    if !resumed.trace.is_empty() {
                        tracing::debug!(trace = ?resumed.trace, "session resumed");
                    }
                }
                effects.push(Effect::Authorized);
                deliver(message, sequence, effects);
                if !self.processing_ready {
                    self.complete(Completion::Resumed, sequence, effects);
                }
            }
            EVENT_GUILD_CREATE => {
                let snapshot = message.body::<GuildSnapshot>();
                deliver(message, sequence, effects);
                match snapshot {
                    Ok(guild) if self.initiating && self.tracker.is_tracking(guild.id) => {
                        let step = self.tracker.acknowledge(
                            guild.id,
                            !guild.unavailable,
                            guild.missing_members(),
                            self.guild_sync && !guild.unavailable,
                        );
                        self.apply_step(step, sequence, effects);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("unexpected GUILD_CREATE body: {e}"),
                }
            }
            EVENT_GUILD_MEMBERS_CHUNK => {
                let chunk = message.body::<GuildMembersChunk>();
                deliver(message, sequence, effects);
                match chunk {
                    Ok(chunk) => {
                        let step = self.tracker.members_chunk(
                            chunk.guild_id,
                            chunk.members.len() as u64,
                            chunk.chunk_count,
                        );
                        self.apply_step(step, sequence, effects);
                    }
                    Err(e) => tracing::warn!("unexpected GUILD_MEMBERS_CHUNK body: {e}"),
                }
            }
            EVENT_GUILD_SYNC => {
                let synced = message.body::<GuildSyncBody>();
                deliver(message, sequence, effects);
                if let Ok(synced) = synced {
                    let step = self.tracker.guild_synced(synced.id);
                    self.apply_step(step, sequence, effects);
                }
            }
            _ => deliver(message, sequence, effects),
        }
    }

    fn on_ready(&mut self, message: GatewayMessage, sequence: u64, effects: &mut Vec<Effect>) {
        let ready = match message.body::<Ready>() {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!("unexpected READY body: {e}");
                return;
            }
        };
        if !ready.trace.is_empty() {
            tracing::debug!(trace = ?ready.trace, "session ready");
        }
        tracing::info!(
            session_id = %ready.session_id,
            guilds = ready.guilds.len(),
            private_channels = ready.private_channels.len(),
            "received READY"
        );

        self.processing_ready = true;
        self.initiating = true;
        effects.push(Effect::SessionStarted {
            session_id: ready.session_id.clone(),
        });
        self.tracker.start(ready.guilds.iter().map(|guild| guild.id));
        deliver(message, sequence, effects);

        // Available entries in READY already carry their snapshot.
        for guild in ready.guilds.iter().filter(|guild| !guild.unavailable) {
            let step = self.tracker.acknowledge(
                guild.id,
                true,
                guild.missing_members(),
                self.guild_sync,
            );
            self.apply_step(step, sequence, effects);
        }
        if self.tracker.is_active() {
            let step = self.tracker.poll();
            self.apply_step(step, sequence, effects);
        }
    }

    fn passes_barrier(&self, event_type: &str) -> bool {
        match event_type {
            EVENT_READY | EVENT_RESUMED | EVENT_GUILD_MEMBERS_CHUNK | EVENT_GUILD_SYNC => true,
            EVENT_GUILD_CREATE => !self.tracker.requests_sent(),
            _ => false,
        }
    }

    fn apply_step(&mut self, step: BootstrapStep, sequence: u64, effects: &mut Vec<Effect>) {
        for batch in step.member_requests {
            match GatewayMessage::command(
                OpCode::RequestGuildMembers,
                &RequestGuildMembers::all(batch),
            ) {
                Ok(request) => effects.push(Effect::Request(request)),
                Err(e) => tracing::warn!("failed to encode member request: {e}"),
            }
        }
        for batch in step.sync_requests {
            let ids: Vec<String> = batch.iter().map(ToString::to_string).collect();
            match GatewayMessage::command(OpCode::GuildSync, &ids) {
                Ok(request) => effects.push(Effect::Request(request)),
                Err(e) => tracing::warn!("failed to encode guild sync: {e}"),
            }
        }
        if step.complete && self.processing_ready {
            self.processing_ready = false;
            let completion = if self.ready_seen {
                Completion::Reconnected
            } else {
                Completion::Ready
            };
            self.ready_seen = true;
            self.complete(completion, sequence, effects);
        }
    }

    fn complete(&mut self, completion: Completion, sequence: u64, effects: &mut Vec<Effect>) {
        self.initiating = false;
        effects.push(Effect::BootstrapComplete(completion));

        let buffered = std::mem::take(&mut self.buffered);
        if !buffered.is_empty() {
            tracing::debug!(count = buffered.len(), "replaying events held during bootstrap");
        }
        for message in buffered {
            self.route(message, sequence, effects);
        }
    }
}

fn deliver(message: GatewayMessage, sequence: u64, effects: &mut Vec<Effect>) {
    let GatewayMessage { d, s, t, .. } = message;
    effects.push(Effect::Deliver(DispatchEvent {
        event_type: t.unwrap_or_default(),
        data: d.unwrap_or(Value::Null),
        sequence,
        frame_sequence: s,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event_type: &str, seq: u64, d: Value) -> GatewayMessage {
        GatewayMessage::dispatch(event_type, Some(seq), d)
    }

    fn delivered(effects: &[Effect]) -> Vec<(String, Option<u64>)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Deliver(event) => Some((event.event_type.clone(), event.frame_sequence)),
                _ => None,
            })
            .collect()
    }

    fn ready(guilds: Value) -> Value {
        json!({"session_id": "sess", "user": {"id": "1"}, "guilds": guilds, "private_channels": []})
    }

    #[test]
    fn buffers_until_all_unavailable_guilds_reported() {
        let mut dispatcher = Dispatcher::new(false);
        let guilds = json!([
            {"id": "10", "unavailable": true},
            {"id": "11", "unavailable": true},
            {"id": "12", "unavailable": true}
        ]);
        let effects = dispatcher.handle(frame(EVENT_READY, 1, ready(guilds)), 1);
        assert!(effects.contains(&Effect::SessionStarted { session_id: "sess".into() }));
        assert!(!effects.iter().any(|e| matches!(e, Effect::BootstrapComplete(_))));

        let held = [
            frame(EVENT_MESSAGE_CREATE, 2, json!({"id": "a"})),
            frame(EVENT_TYPING_START, 3, json!({"id": "b"})),
        ];
        for (n, message) in held.into_iter().enumerate() {
            let effects = dispatcher.handle(message, 2 + n as u64);
            assert!(effects.is_empty());
        }
        assert_eq!(dispatcher.buffered_len(), 2);

        dispatcher.handle(frame(EVENT_GUILD_DELETE, 4, json!({"id": "10", "unavailable": true})), 4);
        dispatcher.handle(frame(EVENT_GUILD_DELETE, 5, json!({"id": "11", "unavailable": true})), 5);
        assert!(dispatcher.is_initiating());

        let effects =
            dispatcher.handle(frame(EVENT_GUILD_DELETE, 6, json!({"id": "12", "unavailable": true})), 6);
        assert_eq!(effects[0], Effect::BootstrapComplete(Completion::Ready));
        assert_eq!(
            delivered(&effects),
            vec![
                (EVENT_MESSAGE_CREATE.to_string(), Some(2)),
                (EVENT_TYPING_START.to_string(), Some(3)),
            ]
        );
        assert!(!dispatcher.is_initiating());
        assert_eq!(dispatcher.buffered_len(), 0);

        // Replay happens exactly once.
        let effects = dispatcher.handle(frame(EVENT_MESSAGE_CREATE, 7, json!({"id": "c"})), 7);
        assert_eq!(delivered(&effects), vec![(EVENT_MESSAGE_CREATE.to_string(), Some(7))]);
    }

    #[test]
    fn replayed_events_carry_current_sequence() {
        let mut dispatcher = Dispatcher::new(false);
        dispatcher.handle(frame(EVENT_READY, 1, ready(json!([{"id": "5", "unavailable": true}]))), 1);
        dispatcher.handle(frame(EVENT_MESSAGE_CREATE, 2, json!({})), 2);
        let effects = dispatcher.handle(frame(EVENT_GUILD_CREATE, 3, json!({"id": "5"})), 3);

        let sequences: Vec<u64> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Deliver(event) => Some(event.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![3, 3]);
        assert!(sequences.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn empty_ready_completes_and_second_ready_is_reconnect() {
        let mut dispatcher = Dispatcher::new(false);
        let effects = dispatcher.handle(frame(EVENT_READY, 1, ready(json!([]))), 1);
        assert!(effects.contains(&Effect::BootstrapComplete(Completion::Ready)));

        dispatcher.invalidate();
        dispatcher.begin_connection();
        let effects = dispatcher.handle(frame(EVENT_READY, 1, ready(json!([]))), 1);
        assert!(effects.contains(&Effect::BootstrapComplete(Completion::Reconnected)));
    }

    #[test]
    fn resumed_releases_buffer() {
        let mut dispatcher = Dispatcher::new(false);
        dispatcher.handle(frame(EVENT_READY, 1, ready(json!([]))), 1);

        dispatcher.begin_connection();
        assert!(dispatcher.handle(frame(EVENT_MESSAGE_CREATE, 2, json!({})), 2).is_empty());
        let effects = dispatcher.handle(frame(EVENT_RESUMED, 3, json!({"_trace": ["gw"]})), 3);
        assert_eq!(effects[0], Effect::Authorized);
        assert!(effects.contains(&Effect::BootstrapComplete(Completion::Resumed)));
        assert_eq!(
            delivered(&effects),
            vec![
                (EVENT_RESUMED.to_string(), Some(3)),
                (EVENT_MESSAGE_CREATE.to_string(), Some(2)),
            ]
        );
    }

    #[test]
    fn presences_replace_fans_out() {
        let mut dispatcher = Dispatcher::new(false);
        dispatcher.handle(frame(EVENT_READY, 1, ready(json!([]))), 1);

        let body = json!([{"user": {"id": "1"}}, {"user": {"id": "2"}}]);
        let effects = dispatcher.handle(frame(EVENT_PRESENCES_REPLACE, 9, body), 9);
        assert_eq!(
            delivered(&effects),
            vec![
                (EVENT_PRESENCE_UPDATE.to_string(), Some(9)),
                (EVENT_PRESENCE_UPDATE.to_string(), Some(9)),
            ]
        );
    }

    #[test]
    fn presences_replace_is_buffered_per_item_during_bootstrap() {
        let mut dispatcher = Dispatcher::new(false);
        dispatcher.handle(frame(EVENT_READY, 1, ready(json!([{"id": "3", "unavailable": true}]))), 1);
        dispatcher.handle(frame(EVENT_PRESENCES_REPLACE, 2, json!([{}, {}, {}])), 2);
        assert_eq!(dispatcher.buffered_len(), 3);
    }

    #[test]
    fn large_guilds_request_members_then_complete() {
        let mut dispatcher = Dispatcher::new(false);
        dispatcher.handle(frame(EVENT_READY, 1, ready(json!([{"id": "20", "unavailable": true}]))), 1);

        let effects = dispatcher.handle(
            frame(EVENT_GUILD_CREATE, 2, json!({"id": "20", "large": true, "member_count": 2, "members": []})),
            2,
        );
        let requests: Vec<&GatewayMessage> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Request(request) => Some(request),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].op, OpCode::RequestGuildMembers);
        assert_eq!(requests[0].d.as_ref().unwrap()["guild_id"], json!(["20"]));

        // Joins after the requests went out wait for bootstrap to finish.
        assert!(dispatcher
            .handle(frame(EVENT_GUILD_CREATE, 3, json!({"id": "21"})), 3)
            .is_empty());

        let effects = dispatcher.handle(
            frame(EVENT_GUILD_MEMBERS_CHUNK, 4, json!({"guild_id": "20", "members": [{}, {}]})),
            4,
        );
        assert!(effects.contains(&Effect::BootstrapComplete(Completion::Ready)));
        assert_eq!(
            delivered(&effects),
            vec![
                (EVENT_GUILD_MEMBERS_CHUNK.to_string(), Some(4)),
                (EVENT_GUILD_CREATE.to_string(), Some(3)),
            ]
        );
    }

    #[test]
    fn non_object_bodies_are_dropped() {
        let mut dispatcher = Dispatcher::new(false);
        dispatcher.handle(frame(EVENT_READY, 1, ready(json!([]))), 1);
        assert!(dispatcher.handle(frame(EVENT_MESSAGE_CREATE, 2, json!("oops")), 2).is_empty());
    }

    #[test]
    fn guild_sync_requests_when_enabled() {
        let mut dispatcher = Dispatcher::new(true);
        let effects = dispatcher.handle(
            frame(EVENT_READY, 1, ready(json!([{"id": "30", "member_count": 1, "members": [{}]}]))),
            1,
        );
        let sync = effects.iter().find_map(|effect| match effect {
            Effect::Request(request) if request.op == OpCode::GuildSync => Some(request.clone()),
            _ => None,
        });
        assert_eq!(sync.unwrap().d, Some(json!(["30"])));

        let effects = dispatcher.handle(frame(EVENT_GUILD_SYNC, 2, json!({"id": "30"})), 2);
        assert!(effects.contains(&Effect::BootstrapComplete(Completion::Ready)));
    }
}
