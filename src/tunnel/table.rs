//! Channel table: the single owner of channel ids on one tunnel connection
//!
//! An id stays taken from the moment a channel is registered until its
//! teardown has finished. Closing moves the slot to a tombstone so the id
//! cannot be handed out while the channel's socket and pumps are still
//! being released.

use super::{Channel, ChannelState, TunnelError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

enum Slot<C> {
    Live(Arc<C>),
    Closing,
}

struct TableInner<C> {
    slots: HashMap<u16, Slot<C>>,
    /// Last id handed out by `allocate`
    cursor: u16,
}

/// Live channels of one tunnel connection
pub struct ChannelTable<C> {
    inner: Mutex<TableInner<C>>,
    capacity: u16,
}

impl<C: Channel> ChannelTable<C> {
    /// Create a table allowing at most `capacity` concurrent channels
    pub fn new(capacity: u16) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: HashMap::new(),
                cursor: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick a free id from `1..=capacity` and register the channel built for it
    ///
    /// Ids are handed out round-robin, so a just-freed id is the last to be
    /// reused.
    pub fn allocate<F>(&self, make: F) -> Result<Arc<C>, TunnelError>
    where
        F: FnOnce(u16) -> Arc<C>,
    {
        let mut inner = self.lock();

        let mut candidate = inner.cursor;
        for _ in 0..self.capacity {
            candidate = if candidate >= self.capacity { 1 } else { candidate + 1 };

            if !inner.slots.contains_key(&candidate) {
                let channel = make(candidate);
                inner.slots.insert(candidate, Slot::Live(Arc::clone(&channel)));
                inner.cursor = candidate;
                return Ok(channel);
            }
        }

        Err(TunnelError::TooManyChannels(self.capacity))
    }

    /// Register a channel under an id chosen by the peer
    pub fn insert(&self, channel: Arc<C>) -> Result<(), TunnelError> {
        let id = channel.id();
        if id == crate::protocol::CONTROL_CHANNEL {
            return Err(TunnelError::ChannelInUse(id));
        }

        let mut inner = self.lock();
        if inner.slots.contains_key(&id) {
            return Err(TunnelError::ChannelInUse(id));
        }
        if inner.slots.len() >= self.capacity as usize {
            return Err(TunnelError::TooManyChannels(self.capacity));
        }

        inner.slots.insert(id, Slot::Live(channel));
        Ok(())
    }

    /// Look up a channel that is not being closed
    pub fn get(&self, id: u16) -> Option<Arc<C>> {
        match self.lock().slots.get(&id) {
            Some(Slot::Live(channel)) => Some(Arc::clone(channel)),
            _ => None,
        }
    }

    /// Lifecycle state as seen by the table
    pub fn state(&self, id: u16) -> ChannelState {
        match self.lock().slots.get(&id) {
            Some(Slot::Live(channel)) => channel.state(),
            Some(Slot::Closing) => ChannelState::Closing,
            None => ChannelState::Closed,
        }
    }

    /// Start closing `id`
    ///
    /// Returns the channel only to the first caller; later or concurrent
    /// callers get `None`, which makes closing idempotent.
    pub fn begin_close(&self, id: u16) -> Option<Arc<C>> {
        let mut inner = self.lock();
        match inner.slots.get(&id) {
            Some(Slot::Live(_)) => match inner.slots.insert(id, Slot::Closing) {
                Some(Slot::Live(channel)) => Some(channel),
                _ => None,
            },
            _ => None,
        }
    }

    /// Return the id of a fully closed channel to the pool
    pub fn finish_close(&self, id: u16) {
        let mut inner = self.lock();
        if matches!(inner.slots.get(&id), Some(Slot::Closing)) {
            inner.slots.remove(&id);
        }
    }

    /// Move every live channel to closing and hand them to the caller
    pub fn drain(&self) -> Vec<Arc<C>> {
        let mut inner = self.lock();
        let mut drained = Vec::new();

        for slot in inner.slots.values_mut() {
            if let Slot::Live(channel) = std::mem::replace(slot, Slot::Closing) {
                drained.push(channel);
            }
        }

        drained
    }

    /// Number of ids currently taken, including channels still closing
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of channels currently open
    pub fn open_ids(&self) -> Vec<u16> {
        let inner = self.lock();
        let mut ids: Vec<u16> = inner
            .slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Live(channel) if channel.state() == ChannelState::Open => Some(*id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}
