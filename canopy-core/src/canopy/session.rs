//! Per-transfer reassembly state and the session table that owns it.
//!
//! A session is created from a Start that decrypts, advanced only by the Data
//! chunk carrying the exact next sequence number, and removed on completion,
//! on a forged trailer, or by the inactivity sweep. Removal is final; a later
//! Start with the same id opens a brand new session.

use canopy_protocol::crypto::Cipher;
use canopy_protocol::wire::{
    open_trailer, DataMessage, ExtraData, SessionId, StartMessage, TRAILER_SIZE,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Why an inbound frame was dropped.
///
/// Deliberately fieldless: it is only ever logged locally and carries nothing
/// that could be echoed back to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame failed positional decoding or a range check.
    Malformed,
    /// No live session with this id.
    UnknownSession,
    /// Start for an id that already has a live session.
    SessionExists,
    /// Start declares fewer bytes than the trailing tag needs.
    LengthTooShort,
    /// Hello or chunk failed authentication.
    Unauthenticated,
    /// Sequence number is not the next expected one.
    OutOfOrder,
    /// Chunk is longer than the bytes still expected.
    Overflow,
    /// Whole-payload tag did not verify.
    ForgedTrailer,
    /// Reply Start for a session that already has one.
    DuplicateStart,
    /// Data for a reply session whose Start has not been accepted.
    NotOpen,
    /// Frame for a session that already finished.
    Finished,
}

/// Outcome of feeding one Data chunk to a [`Reassembly`].
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// More bytes expected.
    Pending,
    /// All bytes received and the trailer verified; holds the payload.
    Complete(Vec<u8>),
}

/// Receive-side state of one transfer.
#[derive(Debug)]
pub struct Reassembly {
    remaining: usize,
    next_seq: usize,
    buffer: Vec<u8>,
    cipher: Arc<Cipher>,
    extra: ExtraData,
    last_activity: Instant,
}

impl Reassembly {
    /// Open a session from a Start. The hello must decrypt under the
    /// current-or-previous key.
    pub fn open(start: &StartMessage, cipher: Arc<Cipher>) -> Result<Self, DropReason> {
        let length = start.length.get();
        if length < TRAILER_SIZE {
            return Err(DropReason::LengthTooShort);
        }
        start
            .verify(&cipher)
            .map_err(|_| DropReason::Unauthenticated)?;

        Ok(Reassembly {
            remaining: length,
            next_seq: 0,
            buffer: Vec::with_capacity(length),
            cipher,
            extra: start.extra,
            last_activity: Instant::now(),
        })
    }

    /// Apply one Data chunk. On any error the state is left untouched, except
    /// [`DropReason::ForgedTrailer`], after which the session must be removed.
    pub fn accept(&mut self, data: &DataMessage) -> Result<Progress, DropReason> {
        if data.seq.get() != self.next_seq {
            return Err(DropReason::OutOfOrder);
        }
        let chunk = data
            .open(&self.cipher)
            .map_err(|_| DropReason::Unauthenticated)?;
        if chunk.len() > self.remaining {
            return Err(DropReason::Overflow);
        }

        self.buffer.extend_from_slice(&chunk);
        self.remaining -= chunk.len();
        self.next_seq += 1;
        self.last_activity = Instant::now();

        if self.remaining > 0 {
            return Ok(Progress::Pending);
        }
        open_trailer(&self.cipher, std::mem::take(&mut self.buffer))
            .map(Progress::Complete)
            .ok_or(DropReason::ForgedTrailer)
    }

    pub fn extra(&self) -> ExtraData {
        self.extra
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// True when nothing was accepted for longer than `timeout`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Whether a session survives the operation applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retain {
    Keep,
    Remove,
}

/// Session id to state map behind one mutex.
///
/// All access goes through closures run under the lock, so callers never
/// hold a reference into the map and never iterate it directly.
pub struct SessionTable<S> {
    sessions: Mutex<HashMap<SessionId, S>>,
}

impl<S> Default for SessionTable<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, S>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Insert `state` unless `id` is live. On collision the state is handed
    /// back untouched.
    pub fn insert_new(&self, id: SessionId, state: S) -> Result<(), S> {
        let mut sessions = self.lock();
        if sessions.contains_key(&id) {
            return Err(state);
        }
        sessions.insert(id, state);
        Ok(())
    }

    /// Build and insert a session atomically with the liveness check.
    pub fn open_with(
        &self,
        id: SessionId,
        build: impl FnOnce() -> Result<S, DropReason>,
    ) -> Result<(), DropReason> {
        let mut sessions = self.lock();
        if sessions.contains_key(&id) {
            return Err(DropReason::SessionExists);
        }
        sessions.insert(id, build()?);
        Ok(())
    }

    /// Run `step` on a live session and drop it if `step` says so.
    ///
    /// # Returns
    /// `None` if no session with `id` exists
    pub fn advance<R>(&self, id: SessionId, step: impl FnOnce(&mut S) -> (R, Retain)) -> Option<R> {
        let mut sessions = self.lock();
        let (result, retain) = step(sessions.get_mut(&id)?);
        if retain == Retain::Remove {
            sessions.remove(&id);
        }
        Some(result)
    }

    pub fn remove(&self, id: SessionId) -> Option<S> {
        self.lock().remove(&id)
    }

    /// Drop every session `expired` selects.
    ///
    /// # Returns
    /// The ids that were removed
    pub fn evict(&self, mut expired: impl FnMut(&S) -> bool) -> Vec<SessionId> {
        let mut sessions = self.lock();
        let mut evicted = Vec::new();
        sessions.retain(|id, state| {
            if expired(state) {
                evicted.push(*id);
                false
            } else {
                true
            }
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_protocol::wire::SealedTransfer;

    fn cipher() -> Arc<Cipher> {
        Arc::new(Cipher::with_key(&[0x33; 32]).unwrap())
    }

    fn sealed(cipher: &Cipher, payload: &[u8]) -> SealedTransfer {
        SealedTransfer::seal(cipher, SessionId(42), ExtraData::default(), payload).unwrap()
    }

    #[tokio::test]
    async fn test_reassembly_completes() {
        let cipher = cipher();
        let transfer = sealed(&cipher, &[9u8; 100]);
        let mut session = Reassembly::open(&transfer.start, cipher.clone()).unwrap();

        let (last, rest) = transfer.chunks.split_last().unwrap();
        for chunk in rest {
            assert_eq!(session.accept(chunk), Ok(Progress::Pending));
        }
        assert_eq!(session.accept(last), Ok(Progress::Complete(vec![9u8; 100])));
        assert_eq!(session.remaining(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_makes_no_progress() {
        let cipher = cipher();
        let transfer = sealed(&cipher, &[1u8; 80]);
        let mut session = Reassembly::open(&transfer.start, cipher.clone()).unwrap();
        let before = session.remaining();

        assert_eq!(session.accept(&transfer.chunks[1]), Err(DropReason::OutOfOrder));
        assert_eq!(session.remaining(), before);

        assert_eq!(session.accept(&transfer.chunks[0]), Ok(Progress::Pending));
        assert_eq!(session.accept(&transfer.chunks[0]), Err(DropReason::OutOfOrder));
        assert_eq!(session.accept(&transfer.chunks[1]), Ok(Progress::Pending));
    }

    #[tokio::test]
    async fn test_start_guards() {
        let cipher = cipher();
        let transfer = sealed(&cipher, b"x");

        let other = Arc::new(Cipher::with_key(&[0x44; 32]).unwrap());
        assert_eq!(
            Reassembly::open(&transfer.start, other).err(),
            Some(DropReason::Unauthenticated)
        );

        let short = StartMessage::seal(
            &cipher,
            SessionId(1),
            canopy_protocol::wire::MessageLength::new(TRAILER_SIZE - 1).unwrap(),
            ExtraData::default(),
        )
        .unwrap();
        assert_eq!(
            Reassembly::open(&short, cipher.clone()).err(),
            Some(DropReason::LengthTooShort)
        );
    }

    #[tokio::test]
    async fn test_overflow_rejected() {
        let cipher = cipher();
        // Declares 30 bytes but the chunks carry 31 + 2
        let start = StartMessage::seal(
            &cipher,
            SessionId(42),
            canopy_protocol::wire::MessageLength::new(30).unwrap(),
            ExtraData::default(),
        )
        .unwrap();
        let transfer = sealed(&cipher, b"hello");
        let mut session = Reassembly::open(&start, cipher.clone()).unwrap();
        assert_eq!(session.accept(&transfer.chunks[0]), Err(DropReason::Overflow));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness() {
        let cipher = cipher();
        let transfer = sealed(&cipher, b"abc");
        let session = Reassembly::open(&transfer.start, cipher).unwrap();
        let timeout = Duration::from_secs(2);

        assert!(!session.is_stale(Instant::now(), timeout));
        tokio::time::advance(Duration::from_millis(2001)).await;
        assert!(session.is_stale(Instant::now(), timeout));
    }

    #[test]
    fn test_table_guards() {
        let table: SessionTable<u32> = SessionTable::new();
        assert_eq!(table.insert_new(SessionId(1), 10), Ok(()));
        assert_eq!(table.insert_new(SessionId(1), 11), Err(11));
        assert_eq!(table.open_with(SessionId(1), || Ok(12)), Err(DropReason::SessionExists));
        assert_eq!(
            table.open_with(SessionId(2), || Err(DropReason::Unauthenticated)),
            Err(DropReason::Unauthenticated)
        );
        assert!(!table.contains(SessionId(2)));

        assert_eq!(table.advance(SessionId(1), |v| (*v, Retain::Keep)), Some(10));
        assert_eq!(table.advance(SessionId(1), |v| (*v + 1, Retain::Remove)), Some(11));
        assert!(table.is_empty());
        assert_eq!(table.advance(SessionId(1), |v| (*v, Retain::Keep)), None);
    }

    #[test]
    fn test_table_evict() {
        let table: SessionTable<u32> = SessionTable::new();
        for id in 0..5 {
            table.insert_new(SessionId(id), id).unwrap();
        }
        let mut evicted = table.evict(|v| v % 2 == 0);
        evicted.sort();
        assert_eq!(evicted, vec![SessionId(0), SessionId(2), SessionId(4)]);
        assert_eq!(table.len(), 2);
    }
}
