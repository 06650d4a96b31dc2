//! Signal/slot dispatch core
//!
//! The connection table maps a signal endpoint (owner + key) to the slots it
//! drives, in connection order. Structural changes take the write lock;
//! blocking a connection only touches an atomic counter on its entry.
//!
//! Channels sit on top of the table: joining one connects the new member to
//! every member of the opposite side. The channel lock is always taken
//! before the table lock.

use super::channel::{Channel, Link, SignalMember, SlotMember};
use crate::com::{
    Arg, ChannelMember, OwnerId, Signature, SignalSource, Slot, SlotError, SlotTarget,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Identifier of an established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SignalEndpoint {
    owner: OwnerId,
    key: String,
}

/// Handle to an established connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    id: ConnectionId,
    signal: SignalEndpoint,
    slot_owner: OwnerId,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn signal_key(&self) -> &str {
        &self.signal.key
    }
}

struct ConnectionEntry {
    id: ConnectionId,
    slot: Slot,
    slot_owner: OwnerId,
    label: String,
    blocked: AtomicUsize,
}

impl ConnectionEntry {
    fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire) > 0
    }
}

/// Re-enables a blocked connection when dropped
#[must_use = "the connection is unblocked as soon as the guard is dropped"]
pub struct BlockGuard {
    entry: Arc<ConnectionEntry>,
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.entry.blocked.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Process context owning every signal/slot connection
#[derive(Default)]
pub struct DispatchCore {
    next_id: AtomicU64,
    table: RwLock<HashMap<SignalEndpoint, Vec<Arc<ConnectionEntry>>>>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl DispatchCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `signal_key` of `source` to `slot_key` of `target`
    pub fn connect(
        &self,
        source: &dyn SignalSource,
        signal_key: &str,
        target: &dyn SlotTarget,
        slot_key: &str,
    ) -> Result<Connection, DispatchError> {
        let signal_sig = signal_signature(source, signal_key)?;
        let slot = target_slot(target, slot_key)?;

        if !slot.signature().is_callable_from(&signal_sig) {
            return Err(DispatchError::SignatureMismatch {
                signal: format!("{}/{}", source.label(), signal_key),
                slot: format!("{}/{}", target.label(), slot_key),
                expected: signal_sig,
                found: slot.signature().clone(),
            });
        }

        let endpoint = SignalEndpoint {
            owner: source.owner_id(),
            key: signal_key.to_string(),
        };
        let connection = self.insert(
            endpoint,
            slot,
            target.owner_id(),
            format!("{}/{}", target.label(), slot_key),
        );

        log::trace!(
            "Connected {}/{} -> {}/{}",
            source.label(),
            signal_key,
            target.label(),
            slot_key
        );
        Ok(connection)
    }

    /// Join `signal_key` of `source` to `channel`.
    ///
    /// The signal is connected to every slot already on the channel and to
    /// every slot joining later, until [`DispatchCore::leave`].
    pub fn join_signal(
        &self,
        channel: &str,
        source: &dyn SignalSource,
        signal_key: &str,
    ) -> Result<ChannelMember, DispatchError> {
        let signature = signal_signature(source, signal_key)?;
        let label = format!("{}/{}", source.label(), signal_key);

        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = channels.get(channel) {
            existing.check_signal(&label, &signature)?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = SignalEndpoint {
            owner: source.owner_id(),
            key: signal_key.to_string(),
        };
        let entry = channels.entry(channel.to_string()).or_default();
        let links: Vec<Link> = entry
            .slots
            .iter()
            .map(|slot| Link {
                signal: id,
                slot: slot.id,
                connection: self.insert(
                    endpoint.clone(),
                    slot.slot.clone(),
                    slot.owner,
                    slot.label.clone(),
                ),
            })
            .collect();
        entry.links.extend(links);
        entry.signals.push(SignalMember {
            id,
            owner: endpoint.owner,
            key: endpoint.key,
            label: label.clone(),
            signature,
        });

        log::debug!("{} joined channel '{}'", label, channel);
        Ok(ChannelMember {
            channel: channel.to_string(),
            id,
        })
    }

    /// Join `slot_key` of `target` to `channel`, connecting it to every
    /// signal on the channel now or later
    pub fn join_slot(
        &self,
        channel: &str,
        target: &dyn SlotTarget,
        slot_key: &str,
    ) -> Result<ChannelMember, DispatchError> {
        let slot = target_slot(target, slot_key)?;
        let label = format!("{}/{}", target.label(), slot_key);

        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = channels.get(channel) {
            existing.check_slot(&label, &slot)?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let owner = target.owner_id();
        let entry = channels.entry(channel.to_string()).or_default();
        let links: Vec<Link> = entry
            .signals
            .iter()
            .map(|signal| Link {
                signal: signal.id,
                slot: id,
                connection: self.insert(
                    SignalEndpoint {
                        owner: signal.owner,
                        key: signal.key.clone(),
                    },
                    slot.clone(),
                    owner,
                    label.clone(),
                ),
            })
            .collect();
        entry.links.extend(links);
        entry.slots.push(SlotMember {
            id,
            owner,
            label: label.clone(),
            slot,
        });

        log::debug!("{} joined channel '{}'", label, channel);
        Ok(ChannelMember {
            channel: channel.to_string(),
            id,
        })
    }

    /// Withdraw a member from its channel, severing the connections the
    /// channel made for it. Returns false if it already left.
    pub fn leave(&self, member: &ChannelMember) -> bool {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = channels.get_mut(&member.channel) else {
            return false;
        };
        let Some(links) = channel.remove_member(member.id) else {
            return false;
        };
        if channel.is_empty() {
            channels.remove(&member.channel);
        }

        for connection in &links {
            self.disconnect(connection);
        }
        log::debug!("Left channel '{}'", member.channel);
        true
    }

    /// Number of signals and slots joined to `channel`
    pub fn channel_size(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(Channel::len)
            .unwrap_or(0)
    }

    /// Sever a connection. Returns false if it was already severed.
    pub fn disconnect(&self, connection: &Connection) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = table.get_mut(&connection.signal) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|e| e.id != connection.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            table.remove(&connection.signal);
        }
        removed
    }

    /// Sever every connection touching `owner`, as signal or slot owner,
    /// and withdraw its channel members
    pub fn disconnect_owner(&self, owner: OwnerId) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, channel| {
            channel.remove_owner(owner);
            !channel.is_empty()
        });

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;

        table.retain(|endpoint, entries| {
            if endpoint.owner == owner {
                removed += entries.len();
                return false;
            }
            let before = entries.len();
            entries.retain(|e| e.slot_owner != owner);
            removed += before - entries.len();
            !entries.is_empty()
        });

        removed
    }

    /// Number of live connections touching `owner`
    pub fn connection_count(&self, owner: OwnerId) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(endpoint, entries)| {
                if endpoint.owner == owner {
                    entries.len()
                } else {
                    entries.iter().filter(|e| e.slot_owner == owner).count()
                }
            })
            .sum()
    }

    pub fn is_connected(&self, connection: &Connection) -> bool {
        self.entry(connection).is_some()
    }

    /// Block a connection until the returned guard is dropped
    pub fn block(&self, connection: &Connection) -> Result<BlockGuard, DispatchError> {
        let entry = self
            .entry(connection)
            .ok_or(DispatchError::UnknownConnection(connection.id))?;
        entry.blocked.fetch_add(1, Ordering::AcqRel);
        Ok(BlockGuard { entry })
    }

    pub fn is_blocked(&self, connection: &Connection) -> bool {
        self.entry(connection)
            .map(|e| e.is_blocked())
            .unwrap_or(false)
    }

    /// Deliver a signal in the caller's context, slot after slot in connection order.
    ///
    /// Every connected slot runs even if an earlier one fails; the first
    /// failure is returned.
    pub async fn emit(
        &self,
        source: &dyn SignalSource,
        signal_key: &str,
        args: Vec<Arg>,
    ) -> Result<(), DispatchError> {
        let entries = self.prepare(source, signal_key, &args)?;
        let mut first_error = None;

        for entry in entries {
            if entry.is_blocked() || !entry.slot.is_accepting() {
                continue;
            }

            if let Err(e) = entry.slot.invoke(args.clone()).await {
                log::warn!("Slot {} failed: {}", entry.label, e);
                if first_error.is_none() {
                    first_error = Some(DispatchError::SlotFailed {
                        slot: entry.label.clone(),
                        source: e,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queue a signal to the worker of every connected slot and return immediately.
    ///
    /// Failures of the queued slots are logged.
    pub fn async_emit(
        &self,
        source: &dyn SignalSource,
        signal_key: &str,
        args: Vec<Arg>,
    ) -> Result<usize, DispatchError> {
        let entries = self.prepare(source, signal_key, &args)?;
        let mut queued = 0;

        for entry in entries {
            if entry.is_blocked() || !entry.slot.is_accepting() {
                continue;
            }

            let slot = entry.slot.clone();
            let label = entry.label.clone();
            let args = args.clone();
            let posted = entry.slot.worker().post(move || async move {
                if let Err(e) = slot.invoke(args).await {
                    log::warn!("Slot {} failed: {}", label, e);
                }
            });

            match posted {
                Ok(()) => queued += 1,
                Err(e) => log::warn!("Dropping delivery to {}: {}", entry.label, e),
            }
        }

        Ok(queued)
    }

    fn insert(
        &self,
        endpoint: SignalEndpoint,
        slot: Slot,
        slot_owner: OwnerId,
        label: String,
    ) -> Connection {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(ConnectionEntry {
            id,
            slot,
            slot_owner,
            label,
            blocked: AtomicUsize::new(0),
        });

        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.clone())
            .or_default()
            .push(entry);

        Connection {
            id,
            signal: endpoint,
            slot_owner,
        }
    }

    /// Validate an emission and snapshot the connected entries
    fn prepare(
        &self,
        source: &dyn SignalSource,
        signal_key: &str,
        args: &[Arg],
    ) -> Result<Vec<Arc<ConnectionEntry>>, DispatchError> {
        let signature = signal_signature(source, signal_key)?;

        if !signature.accepts(args) {
            return Err(DispatchError::ArgumentMismatch {
                signal: format!("{}/{}", source.label(), signal_key),
                expected: signature,
            });
        }

        let endpoint = SignalEndpoint {
            owner: source.owner_id(),
            key: signal_key.to_string(),
        };

        Ok(self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint)
            .cloned()
            .unwrap_or_default())
    }

    fn entry(&self, connection: &Connection) -> Option<Arc<ConnectionEntry>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection.signal)?
            .iter()
            .find(|e| e.id == connection.id)
            .cloned()
    }
}

fn signal_signature(source: &dyn SignalSource, key: &str) -> Result<Signature, DispatchError> {
    source
        .signal_signature(key)
        .ok_or_else(|| DispatchError::UnknownSignal {
            owner: source.label().to_string(),
            key: key.to_string(),
        })
}

fn target_slot(target: &dyn SlotTarget, key: &str) -> Result<Slot, DispatchError> {
    target.slot(key).ok_or_else(|| DispatchError::UnknownSlot {
        owner: target.label().to_string(),
        key: key.to_string(),
    })
}

/// Errors raised by the dispatch core
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("'{owner}' has no signal '{key}'")]
    UnknownSignal { owner: String, key: String },

    #[error("'{owner}' has no slot '{key}'")]
    UnknownSlot { owner: String, key: String },

    #[error("Cannot connect {signal}{expected} to {slot}{found}")]
    SignatureMismatch {
        signal: String,
        slot: String,
        expected: Signature,
        found: Signature,
    },

    #[error("Arguments do not match signal {signal}{expected}")]
    ArgumentMismatch { signal: String, expected: Signature },

    #[error("Unknown connection {0:?}")]
    UnknownConnection(ConnectionId),

    #[error("Slot {slot} failed: {source}")]
    SlotFailed {
        slot: String,
        #[source]
        source: SlotError,
    },
}
