//! Named channels: every signal joined to a channel drives every slot joined
//! to it, whenever either side joins.

use crate::com::{Connection, DispatchError, OwnerId, Signature, Slot};

/// Handle to a signal or slot joined to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMember {
    pub(crate) channel: String,
    pub(crate) id: u64,
}

impl ChannelMember {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

pub(crate) struct SignalMember {
    pub id: u64,
    pub owner: OwnerId,
    pub key: String,
    pub label: String,
    pub signature: Signature,
}

pub(crate) struct SlotMember {
    pub id: u64,
    pub owner: OwnerId,
    pub label: String,
    pub slot: Slot,
}

/// A connection made by the channel between one signal and one slot member
pub(crate) struct Link {
    pub signal: u64,
    pub slot: u64,
    pub connection: Connection,
}

#[derive(Default)]
pub(crate) struct Channel {
    pub signals: Vec<SignalMember>,
    pub slots: Vec<SlotMember>,
    pub links: Vec<Link>,
}

impl Channel {
    /// A new signal must be able to drive every slot already joined
    pub fn check_signal(&self, label: &str, signature: &Signature) -> Result<(), DispatchError> {
        match self
            .slots
            .iter()
            .find(|s| !s.slot.signature().is_callable_from(signature))
        {
            Some(slot) => Err(DispatchError::SignatureMismatch {
                signal: label.to_string(),
                slot: slot.label.clone(),
                expected: signature.clone(),
                found: slot.slot.signature().clone(),
            }),
            None => Ok(()),
        }
    }

    /// A new slot must be callable from every signal already joined
    pub fn check_slot(&self, label: &str, slot: &Slot) -> Result<(), DispatchError> {
        match self
            .signals
            .iter()
            .find(|s| !slot.signature().is_callable_from(&s.signature))
        {
            Some(signal) => Err(DispatchError::SignatureMismatch {
                signal: signal.label.clone(),
                slot: label.to_string(),
                expected: signal.signature.clone(),
                found: slot.signature().clone(),
            }),
            None => Ok(()),
        }
    }

    /// Remove a member and its links, returning the connections to sever
    pub fn remove_member(&mut self, id: u64) -> Option<Vec<Connection>> {
        let before = self.signals.len() + self.slots.len();
        self.signals.retain(|s| s.id != id);
        self.slots.retain(|s| s.id != id);
        if self.signals.len() + self.slots.len() == before {
            return None;
        }
        Some(self.take_links(|link| link.signal == id || link.slot == id))
    }

    /// Remove every member of `owner`, returning the connections to sever
    pub fn remove_owner(&mut self, owner: OwnerId) -> Vec<Connection> {
        let mut gone = Vec::new();
        self.signals.retain(|s| {
            let keep = s.owner != owner;
            if !keep {
                gone.push(s.id);
            }
            keep
        });
        self.slots.retain(|s| {
            let keep = s.owner != owner;
            if !keep {
                gone.push(s.id);
            }
            keep
        });
        self.take_links(|link| gone.contains(&link.signal) || gone.contains(&link.slot))
    }

    pub fn len(&self) -> usize {
        self.signals.len() + self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_links(&mut self, mut matches: impl FnMut(&Link) -> bool) -> Vec<Connection> {
        let mut taken = Vec::new();
        self.links.retain(|link| {
            if matches(link) {
                taken.push(link.connection.clone());
                false
            } else {
                true
            }
        });
        taken
    }
}
