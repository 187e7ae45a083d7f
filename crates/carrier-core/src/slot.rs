//! Completion slots shared between callers and connection tasks.
//!
//! A slot carries one outcome from the task that produces it (the reader for
//! replies, the writer for writes) to the caller waiting on it. Slots are
//! pooled behind `Arc`, so they must be left clean by [`Recycle`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{error::ConnError, pool::Recycle};

#[derive(Debug, Default)]
struct RequestState {
    reply: Vec<u8>,
    outcome: Option<Result<(), ConnError>>,
}

/// Where the reader deposits the reply to one outstanding request.
#[derive(Debug, Default)]
pub struct RequestSlot {
    state: Mutex<RequestState>,
    notify: Notify,
}

impl RequestSlot {
    /// Store `reply` and wake the caller.
    pub(crate) fn complete(&self, reply: &[u8]) {
        {
            let mut state = self.state.lock();
            state.reply.clear();
            state.reply.extend_from_slice(reply);
            state.outcome = Some(Ok(()));
        }
        self.notify.notify_one();
    }

    /// Fail the request and wake the caller.
    pub(crate) fn fail(&self, err: ConnError) {
        self.state.lock().outcome = Some(Err(err));
        self.notify.notify_one();
    }

    /// Copy the reply into `dst` if the request finished.
    ///
    /// Returns `None` while still pending.
    pub(crate) fn take_into(&self, dst: &mut Vec<u8>) -> Option<Result<(), ConnError>> {
        let mut state = self.state.lock();
        let outcome = state.outcome.take()?;
        if outcome.is_ok() {
            dst.clear();
            dst.extend_from_slice(&state.reply);
        }
        Some(outcome)
    }

    /// Wait for the outcome, copying the reply into `dst`.
    pub(crate) async fn wait_into(&self, dst: &mut Vec<u8>) -> Result<(), ConnError> {
        loop {
            if let Some(outcome) = self.take_into(dst) {
                return outcome;
            }
            self.notify.notified().await;
        }
    }
}

impl Recycle for Arc<RequestSlot> {
    fn recycle(&mut self) {
        let mut state = self.state.lock();
        state.reply.clear();
        state.outcome = None;
    }
}

#[derive(Debug, Default)]
struct WriteState {
    frame: Vec<u8>,
    outcome: Option<Result<(), ConnError>>,
    done: bool,
    abandoned: bool,
}

/// One framed message waiting in the writer queue.
#[derive(Debug, Default)]
pub struct WriteSlot {
    state: Mutex<WriteState>,
    notify: Notify,
}

/// What the writer should do with a slot after attempting it.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Handoff {
    /// A caller is waiting and now owns the slot again.
    Delivered,
    /// Nobody will collect the outcome; the writer must recycle the slot.
    Orphaned,
}

impl WriteSlot {
    /// Fill the slot's frame buffer.
    pub(crate) fn fill(&self, fill: impl FnOnce(&mut Vec<u8>)) {
        let mut state = self.state.lock();
        state.frame.clear();
        fill(&mut state.frame);
    }

    /// Move the frame out for writing. Hand it back with
    /// [`restore_frame`](Self::restore_frame) to keep its capacity.
    pub(crate) fn take_frame(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().frame)
    }

    pub(crate) fn restore_frame(&self, frame: Vec<u8>) {
        self.state.lock().frame = frame;
    }

    /// Publish the write outcome to a waiting caller.
    pub(crate) fn complete(&self, outcome: Result<(), ConnError>) -> Handoff {
        let mut state = self.state.lock();
        if state.abandoned {
            return Handoff::Orphaned;
        }
        state.outcome = Some(outcome);
        state.done = true;
        drop(state);
        self.notify.notify_one();
        Handoff::Delivered
    }

    /// Caller gives up waiting.
    ///
    /// Returns [`Handoff::Delivered`] if the outcome already arrived, in
    /// which case the caller still owns the slot.
    pub(crate) fn abandon(&self) -> Handoff {
        let mut state = self.state.lock();
        if state.done {
            return Handoff::Delivered;
        }
        state.abandoned = true;
        Handoff::Orphaned
    }

    /// Wait for the writer to attempt this frame.
    pub(crate) async fn wait(&self) -> Result<(), ConnError> {
        loop {
            let outcome = self.state.lock().outcome.take();
            if let Some(outcome) = outcome {
                return outcome;
            }
            self.notify.notified().await;
        }
    }
}

impl Recycle for Arc<WriteSlot> {
    fn recycle(&mut self) {
        let mut state = self.state.lock();
        state.frame.clear();
        state.outcome = None;
        state.done = false;
        state.abandoned = false;
    }
}
