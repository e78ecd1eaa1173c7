//! A server and an owning client for one actor, joined by a fake network.
//!
//! Every message is encoded with the wire codec on send and decoded on
//! delivery, so anything that does not survive MessagePack never reaches the
//! other peer. Both directions share one fixed latency measured in ticks.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use foresight_abilities::{AbilityDef, AbilityEvent, AbilitySystem, NetRole};
use foresight_core::{ConnectionId, NetTime, PredictionDomain};
use foresight_effects::{AttributeSet, EffectContext, EffectEvent, EffectLibrary, GameplayEffectDef};
use foresight_protocol::{
    client_message_json, deserialize_client_message, deserialize_server_message,
    serialize_client_message, serialize_server_message, server_message_json, AbilityId,
    ClientMessage, ServerMessage,
};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::SimConfig;

/// How the client addresses the server.
pub const SERVER_CONNECTION: ConnectionId = ConnectionId(0);
/// How the server addresses the client.
pub const CLIENT_CONNECTION: ConnectionId = ConnectionId(1);

/// Content both peers are built from.
#[derive(Clone, Debug, Default)]
pub struct Definitions {
    pub effects: Vec<GameplayEffectDef>,
    /// Granted in order on both peers, so ability ids agree.
    pub abilities: Vec<AbilityDef>,
    pub attributes: AttributeSet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToServer,
    ToClient,
}

#[derive(Clone, Debug, Serialize)]
pub struct TranscriptEntry {
    pub sent_at: u64,
    pub direction: Direction,
    pub message: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WireStats {
    pub client_messages: u64,
    pub client_bytes: u64,
    pub server_messages: u64,
    pub server_bytes: u64,
    pub replication_updates: u64,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: u64,
    bytes: Vec<u8>,
}

pub struct Session {
    config: SimConfig,
    server: AbilitySystem,
    client: AbilitySystem,
    tick: u64,
    to_server: VecDeque<InFlight>,
    to_client: VecDeque<InFlight>,
    stats: WireStats,
    transcript: Vec<TranscriptEntry>,
    client_effect_events: Vec<EffectEvent>,
    server_effect_events: Vec<EffectEvent>,
    client_events: Vec<AbilityEvent>,
    server_events: Vec<AbilityEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tick", &self.tick)
            .field("to_server", &self.to_server.len())
            .field("to_client", &self.to_client.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: &SimConfig, defs: &Definitions) -> Result<Self> {
        let peer = |role: NetRole| -> Result<AbilitySystem> {
            let library = EffectLibrary::from_defs(defs.effects.iter().cloned())
                .context("Failed to build effect library")?;
            let ctx = EffectContext::new(PredictionDomain::new(config.prediction.clone()), library);
            let mut system = AbilitySystem::new(&ctx, role, defs.attributes.clone());
            for def in &defs.abilities {
                system.give_ability(def.clone(), 1.0);
            }
            Ok(system)
        };

        let mut session = Self {
            config: config.clone(),
            server: peer(NetRole::Authority {
                owner: CLIENT_CONNECTION,
            })?,
            client: peer(NetRole::AutonomousProxy {
                server: SERVER_CONNECTION,
            })?,
            tick: 0,
            to_server: VecDeque::new(),
            to_client: VecDeque::new(),
            stats: WireStats::default(),
            transcript: Vec::new(),
            client_effect_events: Vec::new(),
            server_effect_events: Vec::new(),
            client_events: Vec::new(),
            server_events: Vec::new(),
        };
        session.spawn()?;
        Ok(session)
    }

    /// Initial state arrives with the actor, before the first tick and
    /// outside the latency model.
    fn spawn(&mut self) -> Result<()> {
        let Some(update) = self.server.replication_update(0) else {
            return Ok(());
        };
        let bytes = serialize_server_message(&ServerMessage::Replication(update))
            .context("Failed to encode spawn state")?;
        let msg = deserialize_server_message(&bytes).context("Failed to decode spawn state")?;
        self.client.handle_server_message(msg);
        self.collect_events();
        Ok(())
    }

    pub fn server(&self) -> &AbilitySystem {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut AbilitySystem {
        &mut self.server
    }

    pub fn client(&self) -> &AbilitySystem {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut AbilitySystem {
        &mut self.client
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn stats(&self) -> WireStats {
        self.stats
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    /// Id of a granted ability, looked up on the client.
    pub fn ability(&self, name: &str) -> Result<AbilityId> {
        self.client
            .find_ability(name)
            .with_context(|| format!("no ability named {name}"))
    }

    pub fn in_flight(&self) -> usize {
        self.to_server.len() + self.to_client.len()
    }

    /// Advance both peers by one tick and move whatever is due.
    pub fn step(&mut self) -> Result<()> {
        self.tick += 1;
        let now = NetTime::synced(self.tick as f64 * self.config.tick_interval());
        self.server.tick(now);
        self.client.tick(now);

        self.flush_client()?;
        self.deliver_to_server()?;
        self.flush_server()?;
        self.deliver_to_client()?;
        // Anything the client sent in reaction to the server.
        self.flush_client()?;

        self.collect_events();
        trace!(tick = self.tick, in_flight = self.in_flight(), "session stepped");
        Ok(())
    }

    /// Step until nothing is in flight, up to `settle_ticks`. Returns whether
    /// the network went quiet.
    pub fn run_until_settled(&mut self) -> Result<bool> {
        for _ in 0..self.config.settle_ticks.max(1) {
            self.step()?;
            if self.in_flight() == 0 {
                debug!(tick = self.tick, "session settled");
                return Ok(true);
            }
        }
        warn!(
            tick = self.tick,
            in_flight = self.in_flight(),
            "session did not settle"
        );
        Ok(false)
    }

    pub fn run_ticks(&mut self, ticks: u64) -> Result<()> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(())
    }

    /// Client-side effect notifications seen so far.
    pub fn take_client_effect_events(&mut self) -> Vec<EffectEvent> {
        self.collect_events();
        std::mem::take(&mut self.client_effect_events)
    }

    pub fn take_server_effect_events(&mut self) -> Vec<EffectEvent> {
        self.collect_events();
        std::mem::take(&mut self.server_effect_events)
    }

    pub fn take_client_events(&mut self) -> Vec<AbilityEvent> {
        self.collect_events();
        std::mem::take(&mut self.client_events)
    }

    pub fn take_server_events(&mut self) -> Vec<AbilityEvent> {
        self.collect_events();
        std::mem::take(&mut self.server_events)
    }

    fn collect_events(&mut self) {
        self.client_effect_events
            .extend(self.client.effects().borrow_mut().drain_events());
        self.server_effect_events
            .extend(self.server.effects().borrow_mut().drain_events());
        self.client_events.extend(self.client.drain_events());
        self.server_events.extend(self.server.drain_events());
    }

    fn deliver_at(&self) -> u64 {
        self.tick + self.config.network.latency_ticks
    }

    fn flush_client(&mut self) -> Result<()> {
        for msg in self.client.take_messages_to_server() {
            let bytes = serialize_client_message(&msg)
                .with_context(|| format!("Failed to encode client message for {}", msg.ability()))?;
            self.stats.client_messages += 1;
            self.stats.client_bytes += bytes.len() as u64;
            if self.config.record_transcript {
                self.record(Direction::ToServer, client_message_json(&msg)?);
            }
            self.to_server.push_back(InFlight {
                deliver_at: self.deliver_at(),
                bytes,
            });
        }
        Ok(())
    }

    fn flush_server(&mut self) -> Result<()> {
        let mut outbound = self.server.take_messages_to_client();
        if let Some(update) = self.server.replication_update(self.tick) {
            if !update.is_empty() {
                self.stats.replication_updates += 1;
                outbound.push(ServerMessage::Replication(update));
            }
        }

        for msg in outbound {
            let bytes =
                serialize_server_message(&msg).context("Failed to encode server message")?;
            self.stats.server_messages += 1;
            self.stats.server_bytes += bytes.len() as u64;
            if self.config.record_transcript {
                self.record(Direction::ToClient, server_message_json(&msg)?);
            }
            self.to_client.push_back(InFlight {
                deliver_at: self.deliver_at(),
                bytes,
            });
        }
        Ok(())
    }

    fn deliver_to_server(&mut self) -> Result<()> {
        while let Some(bytes) = pop_due(&mut self.to_server, self.tick) {
            let msg: ClientMessage =
                deserialize_client_message(&bytes).context("Failed to decode client message")?;
            trace!(tick = self.tick, ability = %msg.ability(), "delivering to server");
            self.server.handle_client_message(msg);
        }
        Ok(())
    }

    fn deliver_to_client(&mut self) -> Result<()> {
        while let Some(bytes) = pop_due(&mut self.to_client, self.tick) {
            let msg: ServerMessage =
                deserialize_server_message(&bytes).context("Failed to decode server message")?;
            trace!(tick = self.tick, "delivering to client");
            self.client.handle_server_message(msg);
        }
        Ok(())
    }

    fn record(&mut self, direction: Direction, message: serde_json::Value) {
        self.transcript.push(TranscriptEntry {
            sent_at: self.tick,
            direction,
            message,
        });
    }
}

fn pop_due(queue: &mut VecDeque<InFlight>, tick: u64) -> Option<Vec<u8>> {
    if queue.front()?.deliver_at > tick {
        return None;
    }
    queue.pop_front().map(|msg| msg.bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foresight_effects::ModOp;

    fn defs() -> Definitions {
        Definitions {
            effects: vec![
                GameplayEffectDef::named("mana_cost").with_modifier("mana", ModOp::Additive, -10.0)
            ],
            abilities: vec![AbilityDef::named("zap").with_cost("mana_cost")],
            attributes: AttributeSet::new().with("mana", 100.0),
        }
    }

    #[test]
    fn messages_wait_out_the_latency() {
        let config = SimConfig::default();
        let latency = config.network.latency_ticks;
        let mut session = Session::new(&config, &defs()).unwrap();
        let zap = session.ability("zap").unwrap();

        session.client_mut().try_activate_ability(zap).unwrap();
        session.step().unwrap();
        assert_eq!(session.stats().client_messages, 1);
        assert_eq!(session.server().attribute("mana"), 100.0);

        session.run_ticks(latency).unwrap();
        assert_eq!(session.server().attribute("mana"), 90.0);
        assert!(session.run_until_settled().unwrap());
        assert_eq!(session.client().attribute("mana"), 90.0);
        assert_eq!(session.client().domain().delegates().outstanding(), 0);
    }

    #[test]
    fn transcript_is_only_kept_on_request() {
        let mut config = SimConfig::default();
        let mut session = Session::new(&config, &defs()).unwrap();
        let zap = session.ability("zap").unwrap();
        session.client_mut().try_activate_ability(zap).unwrap();
        session.run_until_settled().unwrap();
        assert!(session.transcript().is_empty());

        config.record_transcript = true;
        let mut session = Session::new(&config, &defs()).unwrap();
        session.client_mut().try_activate_ability(zap).unwrap();
        session.run_until_settled().unwrap();
        let first = &session.transcript()[0];
        assert_eq!(first.direction, Direction::ToServer);
        assert_eq!(first.message["type"], "ServerTryActivate");
    }
}
