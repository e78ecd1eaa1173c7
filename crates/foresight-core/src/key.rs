//! Prediction keys and their wire contract.

use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::domain::PredictionDomain;

/// Raw key value. Matches the 16-bit width keys travel with on the wire.
pub type KeyId = i16;

/// Opaque identity of a network connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// The part of a key that crosses the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireKey {
    pub current: KeyId,
    pub base: KeyId,
    pub server_initiated: bool,
}

impl WireKey {
    pub const INVALID: WireKey = WireKey {
        current: 0,
        base: 0,
        server_initiated: false,
    };

    pub fn is_valid(&self) -> bool {
        self.current > 0
    }
}

/// Where a key is being sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireTarget {
    /// Client to server: the full key always travels.
    Server,
    /// Server to the given client connection.
    Client(ConnectionId),
}

/// Token correlating a speculative client action with its authoritative outcome.
///
/// Equality only looks at `current`, `base` and the server-initiated flag: a key
/// the client generated and the same key echoed back by the server compare equal
/// even though only the echoed copy carries an origin connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct PredictionKey {
    pub current: KeyId,
    pub base: KeyId,
    is_server_initiated: bool,
    is_stale: bool,
    origin: Option<ConnectionId>,
}

impl PartialEq for PredictionKey {
    fn eq(&self, other: &Self) -> bool {
        self.current == other.current
            && self.base == other.base
            && self.is_server_initiated == other.is_server_initiated
    }
}

impl Eq for PredictionKey {}

impl Hash for PredictionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.current.hash(state);
        self.base.hash(state);
        self.is_server_initiated.hash(state);
    }
}

impl fmt::Display for PredictionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.current, self.base)?;
        if self.is_server_initiated {
            write!(f, "(server)")?;
        }
        Ok(())
    }
}

impl PredictionKey {
    /// The invalid key (`current == 0`): predicts nothing.
    pub const fn invalid() -> Self {
        Self {
            current: 0,
            base: 0,
            is_server_initiated: false,
            is_stale: false,
            origin: None,
        }
    }

    pub fn is_valid_key(&self) -> bool {
        self.current > 0
    }

    pub fn is_server_initiated(&self) -> bool {
        self.is_server_initiated
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn origin(&self) -> Option<ConnectionId> {
        self.origin
    }

    /// Valid, client-predicted (not server-initiated) and not yet resolved.
    pub fn is_local_client_key(&self) -> bool {
        self.current > 0 && !self.is_stale && !self.is_server_initiated
    }

    /// Generated on this peer rather than received from the network.
    pub fn was_locally_generated(&self) -> bool {
        self.current > 0 && self.origin.is_none()
    }

    pub fn was_received(&self) -> bool {
        self.origin.is_some()
    }

    /// Whether further speculative work may be chained off this key.
    pub fn is_valid_for_more_prediction(&self) -> bool {
        self.is_local_client_key()
    }

    /// Flag the key as resolved on this peer; it stays valid for bookkeeping
    /// but no longer predicts anything.
    pub fn mark_stale(&mut self) {
        self.is_stale = true;
    }

    /// Replace `current` with a fresh key that depends on the old one.
    ///
    /// The first dependent key of a chain records the chain head in `base`.
    /// Whenever the replaced key was valid, a dependency is registered so the
    /// replaced key's rejection or catch-up also resolves the new key.
    /// Server-initiated keys never chain.
    pub fn generate_dependent(&mut self, domain: &PredictionDomain) {
        if self.is_server_initiated {
            return;
        }

        let previous = self.current;
        if self.base == 0 {
            self.base = self.current;
        }

        self.current = domain.allocator().next_id();
        self.is_stale = false;
        self.origin = None;

        if previous > 0 {
            domain.delegates().add_dependency(self.current, previous);
        }
    }

    /// Serialize for `target`, applying origin confinement.
    ///
    /// Towards a client the payload is only written when the key has no
    /// recorded origin, originated from that very client, or is
    /// server-initiated. Every other case writes the invalid key.
    pub fn to_wire(&self, target: WireTarget) -> WireKey {
        let visible = match target {
            WireTarget::Server => true,
            WireTarget::Client(conn) => {
                self.is_server_initiated || self.origin.map_or(true, |origin| origin == conn)
            }
        };

        if visible {
            WireKey {
                current: self.current,
                base: self.base,
                server_initiated: self.is_server_initiated,
            }
        } else {
            WireKey::INVALID
        }
    }

    /// Rebuild a key received from `from`. The origin connection is recorded.
    pub fn from_wire(wire: WireKey, from: ConnectionId) -> Self {
        Self {
            current: wire.current,
            base: wire.base,
            is_server_initiated: wire.server_initiated,
            is_stale: false,
            origin: Some(from),
        }
    }
}

/// Whether key `a` was issued no later than key `b` by the same counter.
///
/// Keys live in `1..=KeyId::MAX` and wrap, so order is taken over that
/// circle: `a` precedes `b` when `b` is at most half the key space ahead.
pub fn key_issued_before_or_at(a: KeyId, b: KeyId) -> bool {
    if a <= 0 || b <= 0 {
        return false;
    }
    key_distance(a, b) <= KEY_SPACE / 2
}

/// Steps from `a` forward to `b` around the key circle.
pub(crate) fn key_distance(a: KeyId, b: KeyId) -> i32 {
    (i32::from(b) - i32::from(a)).rem_euclid(KEY_SPACE)
}

const KEY_SPACE: i32 = KeyId::MAX as i32;

/// Per-domain key counter. Positive, increasing, wraps to 1 (never 0).
#[derive(Debug)]
pub struct KeyAllocator {
    last: Cell<KeyId>,
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyAllocator {
    pub fn new() -> Self {
        Self { last: Cell::new(0) }
    }

    /// Resume counting after `last`. Mostly useful to exercise wraparound.
    pub fn starting_after(last: KeyId) -> Self {
        Self {
            last: Cell::new(last),
        }
    }

    pub(crate) fn next_id(&self) -> KeyId {
        let mut next = self.last.get().wrapping_add(1);
        if next <= 0 {
            next = 1;
        }
        self.last.set(next);
        next
    }

    /// Key for a speculative client action. The authority never predicts
    /// against itself, so it gets the invalid key.
    pub fn create_new_prediction_key(&self, is_authority: bool) -> PredictionKey {
        if is_authority {
            return PredictionKey::invalid();
        }

        PredictionKey {
            current: self.next_id(),
            ..PredictionKey::invalid()
        }
    }

    /// Key for a server-originated action that clients should still be able
    /// to correlate. Only the authority may create one.
    pub fn create_new_server_initiated_key(&self, is_authority: bool) -> PredictionKey {
        if !is_authority {
            return PredictionKey::invalid();
        }

        PredictionKey {
            current: self.next_id(),
            is_server_initiated: true,
            ..PredictionKey::invalid()
        }
    }
}
