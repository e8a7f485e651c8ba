// src/messaging/handle.rs
// Opaque sender/receiver handles. A handle is an id into its messenger's
// registry plus the id of that messenger, so a handle can go stale (closed)
// but never dangle, and a handle from another messenger is recognized as
// foreign.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use uuid::Uuid;

use super::errors::{MessengerError, Result};

pub trait Handle: Copy + fmt::Debug {
    const KIND: &'static str;

    fn from_parts(owner: Uuid, id: u64) -> Self;
    fn owner(&self) -> Uuid;
    fn id(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderHandle {
    owner: Uuid,
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverHandle {
    owner: Uuid,
    id: u64,
}

impl Handle for SenderHandle {
    const KIND: &'static str = "sender";

    fn from_parts(owner: Uuid, id: u64) -> Self {
        Self { owner, id }
    }
    fn owner(&self) -> Uuid {
        self.owner
    }
    fn id(&self) -> u64 {
        self.id
    }
}

impl Handle for ReceiverHandle {
    const KIND: &'static str = "receiver";

    fn from_parts(owner: Uuid, id: u64) -> Self {
        Self { owner, id }
    }
    fn owner(&self) -> Uuid {
        self.owner
    }
    fn id(&self) -> u64 {
        self.id
    }
}

enum Slot<B> {
    Open(B),
    Closed,
}

/// Result of closing a handle.
#[derive(Debug, PartialEq, Eq)]
pub enum Closed<B> {
    /// The handle was open; its binding is returned for teardown.
    Now(B),
    /// The handle had been closed before.
    Already,
}

pub struct HandleRegistry<H: Handle, B> {
    owner: Uuid,
    next_id: u64,
    slots: HashMap<u64, Slot<B>>,
    _kind: PhantomData<H>,
}

impl<H: Handle, B: Clone> HandleRegistry<H, B> {
    pub fn new(owner: Uuid) -> Self {
        Self {
            owner,
            next_id: 0,
            slots: HashMap::new(),
            _kind: PhantomData,
        }
    }

    pub fn insert(&mut self, binding: B) -> H {
        self.next_id += 1;
        self.slots.insert(self.next_id, Slot::Open(binding));
        H::from_parts(self.owner, self.next_id)
    }

    /// The binding behind an open handle.
    pub fn get(&self, handle: &H) -> Result<B> {
        match self.slot(handle)? {
            Slot::Open(binding) => Ok(binding.clone()),
            Slot::Closed => Err(MessengerError::InvalidHandle(format!(
                "{} {} is closed",
                H::KIND,
                handle.id()
            ))),
        }
    }

    /// The binding behind `handle` if it is still open, `None` once closed.
    pub fn open_binding(&self, handle: &H) -> Result<Option<B>> {
        match self.slot(handle)? {
            Slot::Open(binding) => Ok(Some(binding.clone())),
            Slot::Closed => Ok(None),
        }
    }

    pub fn close(&mut self, handle: &H) -> Result<Closed<B>> {
        self.slot(handle)?;
        match self.slots.insert(handle.id(), Slot::Closed) {
            Some(Slot::Open(binding)) => Ok(Closed::Now(binding)),
            _ => Ok(Closed::Already),
        }
    }

    /// Closes every open handle, returning their bindings.
    pub fn close_all(&mut self) -> Vec<(H, B)> {
        let owner = self.owner;
        let mut open: Vec<(H, B)> = self
            .slots
            .iter_mut()
            .filter_map(|(id, slot)| match std::mem::replace(slot, Slot::Closed) {
                Slot::Open(binding) => Some((H::from_parts(owner, *id), binding)),
                Slot::Closed => None,
            })
            .collect();
        open.sort_by_key(|(handle, _)| handle.id());
        open
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }

    fn slot(&self, handle: &H) -> Result<&Slot<B>> {
        if handle.owner() != self.owner {
            return Err(MessengerError::InvalidHandle(format!(
                "{} {} belongs to another messenger",
                H::KIND,
                handle.id()
            )));
        }
        self.slots.get(&handle.id()).ok_or_else(|| {
            MessengerError::InvalidHandle(format!("{} {} was never created", H::KIND, handle.id()))
        })
    }
}
