//! Pending-reply arena for the sandboxed binding.
//!
//! Ids are generational: `(generation << 16) | index`. A slot's generation
//! is bumped when its entry is consumed, so a late or duplicated reply for
//! an old id can never match the slot's next occupant.

use super::protocol::{decode_bool, CallbackId};
use common::{invoke_guarded, Completion, MessageSequence, TokenCallback};
use serde_json::Value;
use tracing::warn;

const INDEX_BITS: u32 = 16;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// What a reply for a given id decodes into.
pub enum ReplyHandler {
    Bool(Completion<bool>),
    Messages(Completion<Option<MessageSequence>>),
    /// Any `null` element (a NaN on the worker side) rejects the whole vector.
    Floats(Completion<Option<Vec<f32>>>),
    Size(Completion<Option<usize>>),
    /// Repeating; stays registered until its linked done id fires.
    Token(TokenCallback),
}

impl ReplyHandler {
    fn shape(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Messages(_) => "messages",
            Self::Floats(_) => "floats",
            Self::Size(_) => "size",
            Self::Token(_) => "token",
        }
    }

    /// Decode `result` and invoke the completion.
    pub fn complete(self, id: CallbackId, result: &Value) {
        let label = self.shape();
        match self {
            Self::Bool(done) => {
                let ok = decode_bool(result);
                invoke_guarded(label, move || done(ok));
            }
            Self::Messages(done) => {
                let messages = decode_messages(id, result);
                invoke_guarded(label, move || done(messages));
            }
            Self::Floats(done) => {
                let values = decode_floats(id, result);
                invoke_guarded(label, move || done(values));
            }
            Self::Size(done) => {
                let size = result.as_u64().and_then(|n| usize::try_from(n).ok());
                invoke_guarded(label, move || done(size));
            }
            Self::Token(_) => warn!("Token handler {:#x} cannot be completed", id),
        }
    }

    /// Complete with the failure value of the shape.
    pub fn fail(self) {
        let label = self.shape();
        match self {
            Self::Bool(done) => {
                invoke_guarded(label, move || done(false));
            }
            Self::Messages(done) => {
                invoke_guarded(label, move || done(None));
            }
            Self::Floats(done) => {
                invoke_guarded(label, move || done(None));
            }
            Self::Size(done) => {
                invoke_guarded(label, move || done(None));
            }
            Self::Token(_) => {}
        }
    }
}

fn decode_messages(id: CallbackId, result: &Value) -> Option<MessageSequence> {
    if result.is_null() {
        return None;
    }
    match serde_json::from_value(result.clone()) {
        Ok(messages) => Some(messages),
        Err(e) => {
            warn!("Malformed message sequence for {:#x}: {}", id, e);
            None
        }
    }
}

fn decode_floats(id: CallbackId, result: &Value) -> Option<Vec<f32>> {
    if result.is_null() {
        return None;
    }
    let values: Vec<Option<f32>> = match serde_json::from_value(result.clone()) {
        Ok(values) => values,
        Err(e) => {
            warn!("Malformed float vector for {:#x}: {}", id, e);
            return None;
        }
    };
    let total = values.len();
    let decoded: Option<Vec<f32>> = values.into_iter().collect();
    if decoded.is_none() {
        warn!(
            "Rejecting vector of {} values for {:#x}: NaN in sandbox output",
            total, id
        );
    }
    decoded
}

/// Outcome of looking up a reply's id.
pub enum Resolved {
    /// A token for a live generation; the entry stays registered.
    Token(TokenCallback),
    /// Terminal reply; the entry (and any linked token entry) was removed.
    Final(ReplyHandler),
    /// Unknown, consumed or recycled id.
    Stale,
}

struct Entry {
    handler: ReplyHandler,
    /// Token entry released together with this one
    linked: Option<CallbackId>,
}

struct Slot {
    generation: u16,
    entry: Option<Entry>,
}

#[derive(Default)]
pub struct CallbackRegistry {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of a vacant slot, growing the arena when needed.
    fn reserve(&mut self) -> Option<u16> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        let index = u16::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot {
            generation: 1,
            entry: None,
        });
        Some(index)
    }

    fn fill(&mut self, index: u16, entry: Entry) -> CallbackId {
        let slot = &mut self.slots[usize::from(index)];
        slot.entry = Some(entry);
        (u32::from(slot.generation) << INDEX_BITS) | u32::from(index)
    }

    /// Register a one-shot handler. Hands it back when every slot is in use.
    pub fn register(&mut self, handler: ReplyHandler) -> Result<CallbackId, ReplyHandler> {
        match self.reserve() {
            Some(index) => Ok(self.fill(
                index,
                Entry {
                    handler,
                    linked: None,
                },
            )),
            None => Err(handler),
        }
    }

    /// Register the token/done pair of one generation call.
    ///
    /// Returns `(token_id, done_id)`. Consuming the done id removes both.
    /// Hands `done` back when the arena is full.
    pub fn register_generation(
        &mut self,
        on_token: TokenCallback,
        done: Completion<bool>,
    ) -> Result<(CallbackId, CallbackId), Completion<bool>> {
        let Some(token_index) = self.reserve() else {
            return Err(done);
        };
        let Some(done_index) = self.reserve() else {
            self.free.push(token_index);
            return Err(done);
        };
        let token_id = self.fill(
            token_index,
            Entry {
                handler: ReplyHandler::Token(on_token),
                linked: None,
            },
        );
        let done_id = self.fill(
            done_index,
            Entry {
                handler: ReplyHandler::Bool(done),
                linked: Some(token_id),
            },
        );
        Ok((token_id, done_id))
    }

    fn slot_mut(&mut self, id: CallbackId) -> Option<&mut Slot> {
        let index = usize::try_from(id & INDEX_MASK).ok()?;
        let generation = id >> INDEX_BITS;
        let slot = self.slots.get_mut(index)?;
        if u32::from(slot.generation) != generation || slot.entry.is_none() {
            return None;
        }
        Some(slot)
    }

    /// Remove an entry, retiring its id.
    fn take(&mut self, id: CallbackId) -> Option<Entry> {
        let slot = self.slot_mut(id)?;
        let entry = slot.entry.take()?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.free.push((id & INDEX_MASK) as u16);
        Some(entry)
    }

    /// Route a reply for `id`.
    pub fn resolve(&mut self, id: CallbackId) -> Resolved {
        let Some(slot) = self.slot_mut(id) else {
            return Resolved::Stale;
        };
        if let Some(Entry {
            handler: ReplyHandler::Token(on_token),
            ..
        }) = &slot.entry
        {
            return Resolved::Token(on_token.clone());
        }
        match self.take(id) {
            Some(entry) => {
                if let Some(token_id) = entry.linked {
                    self.take(token_id);
                }
                Resolved::Final(entry.handler)
            }
            None => Resolved::Stale,
        }
    }

    /// Remove a request that never reached the worker, with its linked token.
    pub fn cancel(&mut self, id: CallbackId) -> Option<ReplyHandler> {
        let entry = self.take(id)?;
        if let Some(token_id) = entry.linked {
            self.take(token_id);
        }
        Some(entry.handler)
    }

    /// Remove every pending entry, for failing them when the worker is gone.
    pub fn drain(&mut self) -> Vec<ReplyHandler> {
        let live: Vec<CallbackId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| (u32::from(slot.generation) << INDEX_BITS) | index as u32)
            .collect();
        live.into_iter()
            .filter_map(|id| self.take(id))
            .map(|entry| entry.handler)
            .collect()
    }
}
