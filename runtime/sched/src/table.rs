//! Thread arena and scheduling lists
//!
//! Threads sit in generation-checked slots. Each live thread is listed in
//! exactly one of `active`, `sleeping`, `paused` or `pending_free`, and the
//! list always agrees with [`Thread::state`].

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::thread::{Thread, ThreadId, ThreadState};

/// Number of threads in each scheduling list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadCounts {
    pub active: usize,
    pub sleeping: usize,
    pub paused: usize,
    pub terminated: usize,
}

impl ThreadCounts {
    pub fn total(&self) -> usize {
        self.active + self.sleeping + self.paused + self.terminated
    }
}

struct Slot {
    generation: u32,
    thread: Option<Thread>,
}

#[derive(Default)]
pub(crate) struct ThreadTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    active: VecDeque<ThreadId>,
    sleeping: VecDeque<ThreadId>,
    paused: VecDeque<ThreadId>,
    pending_free: Vec<ThreadId>,
    total_active_priority: u64,
}

fn position_in<'a>(list: impl IntoIterator<Item = &'a ThreadId>, id: ThreadId) -> Option<usize> {
    list.into_iter().position(|existing| *existing == id)
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `thread` and queue it according to its state
    pub fn insert(&mut self, mut thread: Thread) -> ThreadId {
        if thread.state == ThreadState::Terminated {
            thread.state = ThreadState::Active;
        }
        let state = thread.state;
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.thread = Some(thread);
                ThreadId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    thread: Some(thread),
                });
                ThreadId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        match state {
            ThreadState::Active => self.push_active(id, false),
            ThreadState::Sleeping => self.insert_sleeping(id),
            ThreadState::Paused => self.paused.push_back(id),
            ThreadState::Terminated => self.pending_free.push(id),
        }
        id
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.thread.as_ref()
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.thread.as_mut()
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.get(id).is_some()
    }

    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.get(id).map(Thread::state)
    }

    fn weight(&self, id: ThreadId) -> u64 {
        self.get(id).map_or(0, Thread::weight)
    }

    fn set_state(&mut self, id: ThreadId, state: ThreadState) {
        if let Some(thread) = self.get_mut(id) {
            thread.state = state;
        }
    }

    fn push_active(&mut self, id: ThreadId, front: bool) {
        self.total_active_priority = self.total_active_priority.saturating_add(self.weight(id));
        self.set_state(id, ThreadState::Active);
        if front {
            self.active.push_front(id);
        } else {
            self.active.push_back(id);
        }
    }

    /// Sorted by deadline; equal deadlines keep insertion order
    fn insert_sleeping(&mut self, id: ThreadId) {
        let deadline = self.get(id).map_or(0, Thread::wake_at);
        let position = self
            .sleeping
            .iter()
            .position(|other| self.get(*other).map_or(0, Thread::wake_at) > deadline)
            .unwrap_or(self.sleeping.len());
        self.sleeping.insert(position, id);
    }

    /// Unlink `id` from whichever list holds it
    fn unlink(&mut self, id: ThreadId) -> Option<ThreadState> {
        let state = self.state(id)?;
        match state {
            ThreadState::Active => {
                let index = position_in(&self.active, id)?;
                self.active.remove(index);
                self.total_active_priority = self.total_active_priority.saturating_sub(self.weight(id));
            }
            ThreadState::Sleeping => {
                let index = position_in(&self.sleeping, id)?;
                self.sleeping.remove(index);
            }
            ThreadState::Paused => {
                let index = position_in(&self.paused, id)?;
                self.paused.remove(index);
            }
            ThreadState::Terminated => {
                let index = position_in(&self.pending_free, id)?;
                self.pending_free.remove(index);
            }
        }
        Some(state)
    }

    /// Active -> Sleeping until `deadline`
    pub fn sleep(&mut self, id: ThreadId, deadline: u64) -> bool {
        if self.state(id) != Some(ThreadState::Active) {
            return false;
        }
        self.unlink(id);
        if let Some(thread) = self.get_mut(id) {
            thread.state = ThreadState::Sleeping;
            thread.wake_at = deadline;
        }
        self.insert_sleeping(id);
        true
    }

    /// Active -> Paused
    pub fn pause(&mut self, id: ThreadId) -> bool {
        if self.state(id) != Some(ThreadState::Active) {
            return false;
        }
        self.unlink(id);
        self.set_state(id, ThreadState::Paused);
        self.paused.push_back(id);
        true
    }

    /// Sleeping threads go to the front of the active list, paused ones to the tail
    pub fn resume(&mut self, id: ThreadId) -> bool {
        match self.state(id) {
            Some(ThreadState::Sleeping) => {
                self.unlink(id);
                self.push_active(id, true);
                true
            }
            Some(ThreadState::Paused) => {
                self.unlink(id);
                self.push_active(id, false);
                true
            }
            _ => false,
        }
    }

    /// Any live state -> Terminated, queued for reaping
    pub fn terminate(&mut self, id: ThreadId) -> bool {
        match self.state(id) {
            None | Some(ThreadState::Terminated) => false,
            Some(_) => {
                self.unlink(id);
                self.set_state(id, ThreadState::Terminated);
                self.pending_free.push(id);
                true
            }
        }
    }

    /// Move every sleeper whose deadline has passed to the front of the
    /// active list, earliest deadline first
    pub fn wake_expired(&mut self, now: u64) -> usize {
        let expired = self
            .sleeping
            .iter()
            .take_while(|id| self.get(**id).map_or(true, |thread| thread.wake_at <= now))
            .count();
        let woken: Vec<ThreadId> = self.sleeping.drain(..expired).collect();
        for id in woken.iter().rev() {
            self.push_active(*id, true);
        }
        woken.len()
    }

    pub fn head(&self) -> Option<ThreadId> {
        self.active.front().copied()
    }

    /// Move an active thread to the tail of the active list
    pub fn requeue(&mut self, id: ThreadId) -> bool {
        match position_in(&self.active, id) {
            Some(index) => {
                self.active.remove(index);
                self.active.push_back(id);
                true
            }
            None => false,
        }
    }

    /// Drop a thread from the table entirely, whatever its state
    pub fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        self.unlink(id)?;
        let slot = self.slots.get_mut(id.index as usize)?;
        let thread = slot.thread.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        thread
    }

    /// Remove every terminated thread except `keep`
    pub fn take_terminated(&mut self, keep: Option<ThreadId>) -> Vec<(ThreadId, Thread)> {
        let ready: Vec<ThreadId> = self
            .pending_free
            .iter()
            .copied()
            .filter(|id| Some(*id) != keep)
            .collect();
        ready
            .into_iter()
            .filter_map(|id| self.remove(id).map(|thread| (id, thread)))
            .collect()
    }

    pub fn set_priority(&mut self, id: ThreadId, priority: u32) -> bool {
        let Some(thread) = self.get_mut(id) else {
            return false;
        };
        thread.set_priority(priority);
        self.recompute_total();
        true
    }

    /// Re-sum the active weights after a thread or process priority change
    pub fn recompute_total(&mut self) -> u64 {
        self.total_active_priority = self
            .active
            .iter()
            .map(|id| self.weight(*id))
            .fold(0u64, u64::saturating_add);
        self.total_active_priority
    }

    pub fn total_active_priority(&self) -> u64 {
        self.total_active_priority
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.active.iter().copied()
    }

    pub fn sleeping(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.sleeping.iter().copied()
    }

    pub fn counts(&self) -> ThreadCounts {
        ThreadCounts {
            active: self.active.len(),
            sleeping: self.sleeping.len(),
            paused: self.paused.len(),
            terminated: self.pending_free.len(),
        }
    }

    /// How many lists mention `id`
    #[cfg(test)]
    fn memberships(&self, id: ThreadId) -> usize {
        self.active.iter().filter(|x| **x == id).count()
            + self.sleeping.iter().filter(|x| **x == id).count()
            + self.paused.iter().filter(|x| **x == id).count()
            + self.pending_free.iter().filter(|x| **x == id).count()
    }
}
