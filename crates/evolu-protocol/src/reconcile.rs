//! Range-based set reconciliation.
//!
//! Two parties each hold a set of timestamps (with attached ciphertexts)
//! and exchange [`RangeEntry`] sequences until both hold the union. The
//! responder algorithm is stateless: every reply is computed from the
//! incoming frame and current storage alone.
//!
//! Per-range rules:
//!
//! - `Fingerprint` equal to ours: reply `Skip`. Mismatch: reply our
//!   inventory when the range is small, otherwise split at the median rank
//!   and reply per half. An empty local range replies with an empty
//!   inventory, which makes the peer push everything.
//! - `Timestamps` (peer inventory): push what the peer lacks as items,
//!   request what we lack. A range with no difference replies `Skip`.
//! - `TimestampsWithChanges`: items are applied (atomically, for the whole
//!   frame); requests are answered with items. A pure data delivery is
//!   answered with our digest so the pusher can confirm convergence.
//! - `Skip`: the peer needs nothing more here; mirror it.
//!
//! A frame whose reply would be all `Skip` means the session is settled.
//! Every round either halves an unresolved range or moves concrete
//! content, so rounds are O(log |Δ|) plus a constant.

use std::collections::BTreeSet;

use evolu_core::{EncryptedMessage, EvoluError, OwnerId, Timestamp, TimestampRange};
use tracing::trace;

use crate::messages::{RangeEntry, RangePayload};
use crate::store::MessageStore;

/// Pre-write hook: lets the caller reject incoming timestamps (clock-drift
/// policy) before anything is persisted.
pub type WriteGuard<'g> = &'g mut dyn FnMut(&Timestamp) -> Result<(), EvoluError>;

/// Reconciliation tunables.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// Ranges at or below this size are sent as explicit lists.
    pub list_threshold: usize,
    /// Upper bound on timestamps or items in one payload.
    pub max_items: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            list_threshold: 50,
            max_items: 500,
        }
    }
}

/// Result of processing one incoming frame.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    /// Entries to send back, covering the incoming frame's key space.
    pub response: Vec<RangeEntry>,
    /// Timestamps newly written to storage by this frame, ascending.
    pub applied: Vec<Timestamp>,
}

impl FrameOutcome {
    /// True when the reply carries no work: every entry is `Skip`.
    pub fn is_settled(&self) -> bool {
        self.response.iter().all(|entry| entry.payload.is_skip())
    }
}

/// The range engine, bound to one owner over one store.
pub struct Reconciler<'a, S: MessageStore + ?Sized> {
    store: &'a mut S,
    owner: OwnerId,
    config: ReconcileConfig,
}

impl<'a, S: MessageStore + ?Sized> Reconciler<'a, S> {
    /// Bind the engine to a store and owner.
    pub fn new(store: &'a mut S, owner: OwnerId, config: ReconcileConfig) -> Self {
        Self {
            store,
            owner,
            config,
        }
    }

    // Degenerate tunables would stall the protocol (a threshold of zero can
    // never fall back to a list); clamp at the point of use.
    fn list_threshold(&self) -> u64 {
        self.config.list_threshold.max(1) as u64
    }

    fn max_items(&self) -> usize {
        self.config.max_items.max(1)
    }

    /// Entries for a session-opening frame: the full key space, with any
    /// locally queued messages pushed eagerly as change-carrying entries.
    ///
    /// `pending` must be sorted ascending by timestamp.
    pub fn initial_entries(
        &mut self,
        pending: &[EncryptedMessage],
    ) -> Result<Vec<RangeEntry>, EvoluError> {
        if pending.is_empty() {
            return self.entries_for_range(&TimestampRange::full());
        }

        let mut entries = Vec::new();
        let first = pending[0].timestamp;
        if first > Timestamp::MIN {
            entries.extend(
                self.entries_for_range(&TimestampRange::new(Timestamp::MIN, first))?,
            );
        }
        let chunks: Vec<&[EncryptedMessage]> = pending.chunks(self.max_items()).collect();
        let last_index = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            // The final chunk absorbs the tail of the key space; the
            // responder's digest reply covers it next round.
            let upper = if i == last_index {
                Timestamp::MAX
            } else {
                chunk
                    .last()
                    .and_then(|m| m.timestamp.successor())
                    .unwrap_or(Timestamp::MAX)
            };
            entries.push(RangeEntry::new(
                upper,
                RangePayload::TimestampsWithChanges {
                    requests: Vec::new(),
                    items: chunk.to_vec(),
                    has_more: false,
                },
            ));
        }
        Ok(entries)
    }

    /// Apply and answer one incoming frame.
    ///
    /// All pushed items in the frame are written in a single atomic batch
    /// before any reply entry is computed, so replies describe post-apply
    /// state. `guard` runs over every incoming timestamp first; its error
    /// aborts the frame with nothing persisted.
    pub fn process_entries(
        &mut self,
        entries: &[RangeEntry],
        mut guard: Option<WriteGuard<'_>>,
    ) -> Result<FrameOutcome, EvoluError> {
        let incoming: Vec<EncryptedMessage> = entries
            .iter()
            .filter_map(|entry| match &entry.payload {
                RangePayload::TimestampsWithChanges { items, .. } => Some(items.iter()),
                _ => None,
            })
            .flatten()
            .cloned()
            .collect();

        if let Some(guard) = guard.as_mut() {
            for message in &incoming {
                guard(&message.timestamp)?;
            }
        }

        let applied = if incoming.is_empty() {
            Vec::new()
        } else {
            self.store.write_messages(&self.owner, &incoming)?
        };
        trace!(
            owner = %self.owner,
            incoming = incoming.len(),
            applied = applied.len(),
            "frame items applied"
        );

        let mut response = Vec::new();
        let mut lo = Timestamp::MIN;
        for entry in entries {
            let range = TimestampRange::new(lo, entry.upper);
            response.extend(self.respond_to(&range, &entry.payload)?);
            lo = entry.upper;
        }
        Ok(FrameOutcome { response, applied })
    }

    fn respond_to(
        &mut self,
        range: &TimestampRange,
        payload: &RangePayload,
    ) -> Result<Vec<RangeEntry>, EvoluError> {
        match payload {
            RangePayload::Skip => Ok(vec![RangeEntry::new(range.hi, RangePayload::Skip)]),

            RangePayload::Fingerprint(theirs) => {
                let ours = self.store.fingerprint(&self.owner, range)?;
                if ours == *theirs {
                    return Ok(vec![RangeEntry::new(range.hi, RangePayload::Skip)]);
                }
                let size = self.store.size(&self.owner, range)?;
                if size > self.list_threshold() {
                    self.split_entries(range, size)
                } else {
                    // Covers the empty case: an empty inventory invites the
                    // peer to push the whole range.
                    self.entries_for_range(range)
                }
            }

            RangePayload::Timestamps {
                timestamps,
                has_more,
            } => {
                if *has_more {
                    // The list only speaks for [lo, successor(last)); answer
                    // the remainder from our own state.
                    let cut = timestamps
                        .last()
                        .and_then(|ts| ts.successor())
                        .filter(|cut| *cut < range.hi);
                    match cut {
                        Some(cut) => {
                            let head = TimestampRange::new(range.lo, cut);
                            let mut out = self.diff_inventory(&head, timestamps)?;
                            out.extend(
                                self.entries_for_range(&TimestampRange::new(cut, range.hi))?,
                            );
                            Ok(out)
                        }
                        None => self.diff_inventory(range, timestamps),
                    }
                } else {
                    self.diff_inventory(range, timestamps)
                }
            }

            RangePayload::TimestampsWithChanges {
                requests, items, ..
            } => {
                // Items were applied in the batch pass.
                if requests.is_empty() {
                    if items.is_empty() {
                        return Ok(vec![RangeEntry::new(range.hi, RangePayload::Skip)]);
                    }
                    // Pure delivery: reply with our digest so the pusher can
                    // confirm the range converged.
                    return self.entries_for_range(range);
                }
                self.answer_requests(range, requests)
            }
        }
    }

    /// Our digest or inventory for a range: `Timestamps` at or below the
    /// list threshold (empty list for an empty range), `Fingerprint` above.
    fn entries_for_range(&mut self, range: &TimestampRange) -> Result<Vec<RangeEntry>, EvoluError> {
        let size = self.store.size(&self.owner, range)?;
        if size <= self.list_threshold() {
            let timestamps = self.store.timestamps(&self.owner, range, None)?;
            Ok(vec![RangeEntry::new(
                range.hi,
                RangePayload::Timestamps {
                    timestamps,
                    has_more: false,
                },
            )])
        } else {
            let fp = self.store.fingerprint(&self.owner, range)?;
            Ok(vec![RangeEntry::new(range.hi, RangePayload::Fingerprint(fp))])
        }
    }

    /// Split a mismatched range at the median rank.
    fn split_entries(
        &mut self,
        range: &TimestampRange,
        size: u64,
    ) -> Result<Vec<RangeEntry>, EvoluError> {
        let mid = self
            .store
            .timestamp_at_rank(&self.owner, range, (size / 2).max(1))?
            .ok_or_else(|| EvoluError::storage("range shrank during split"))?;
        let mut out = self.entries_for_range(&TimestampRange::new(range.lo, mid))?;
        out.extend(self.entries_for_range(&TimestampRange::new(mid, range.hi))?);
        Ok(out)
    }

    /// Diff the peer's complete inventory of `range` against ours.
    fn diff_inventory(
        &mut self,
        range: &TimestampRange,
        theirs: &[Timestamp],
    ) -> Result<Vec<RangeEntry>, EvoluError> {
        let max_items = self.max_items();
        let mine = self
            .store
            .timestamps(&self.owner, range, Some(max_items + 1))?;
        if mine.len() > max_items {
            // Our side is too big to diff in one go: handle the prefix we
            // fetched, describe the rest so the peer comes back for it.
            let cut = mine[max_items - 1]
                .successor()
                .filter(|cut| *cut < range.hi);
            if let Some(cut) = cut {
                let head_range = TimestampRange::new(range.lo, cut);
                let theirs_head: Vec<Timestamp> =
                    theirs.iter().filter(|ts| **ts < cut).copied().collect();
                let mut out = self.diff_lists(&head_range, &theirs_head, &mine[..max_items])?;
                out.extend(self.entries_for_range(&TimestampRange::new(cut, range.hi))?);
                return Ok(out);
            }
        }
        self.diff_lists(range, theirs, &mine)
    }

    fn diff_lists(
        &mut self,
        range: &TimestampRange,
        theirs: &[Timestamp],
        mine: &[Timestamp],
    ) -> Result<Vec<RangeEntry>, EvoluError> {
        let their_set: BTreeSet<Timestamp> = theirs.iter().copied().collect();
        let my_set: BTreeSet<Timestamp> = mine.iter().copied().collect();

        let push: Vec<Timestamp> = my_set.difference(&their_set).copied().collect();
        let want: Vec<Timestamp> = their_set.difference(&my_set).copied().collect();

        if push.is_empty() && want.is_empty() {
            return Ok(vec![RangeEntry::new(range.hi, RangePayload::Skip)]);
        }

        if push.len() + want.len() > self.max_items() {
            // Bound the payload: resolve a prefix of the differences now,
            // describe the tail for the next round.
            let mut boundary_points: Vec<Timestamp> =
                push.iter().chain(want.iter()).copied().collect();
            boundary_points.sort_unstable();
            let cut = boundary_points[self.max_items() - 1]
                .successor()
                .filter(|cut| *cut < range.hi);
            if let Some(cut) = cut {
                let head = TimestampRange::new(range.lo, cut);
                let push_head: Vec<Timestamp> =
                    push.into_iter().filter(|ts| *ts < cut).collect();
                let want_head: Vec<Timestamp> =
                    want.into_iter().filter(|ts| *ts < cut).collect();
                let mut out = vec![self.push_entry(&head, push_head, want_head)?];
                out.extend(self.entries_for_range(&TimestampRange::new(cut, range.hi))?);
                return Ok(out);
            }
        }

        Ok(vec![self.push_entry(range, push, want)?])
    }

    fn push_entry(
        &mut self,
        range: &TimestampRange,
        push: Vec<Timestamp>,
        want: Vec<Timestamp>,
    ) -> Result<RangeEntry, EvoluError> {
        let mut items = Vec::with_capacity(push.len());
        for ts in push {
            if let Some(ciphertext) = self.store.read_change(&self.owner, &ts)? {
                items.push(EncryptedMessage::new(ts, ciphertext));
            }
        }
        Ok(RangeEntry::new(
            range.hi,
            RangePayload::TimestampsWithChanges {
                requests: want,
                items,
                has_more: false,
            },
        ))
    }

    /// Answer a want-list with the requested ciphertexts.
    fn answer_requests(
        &mut self,
        range: &TimestampRange,
        requests: &[Timestamp],
    ) -> Result<Vec<RangeEntry>, EvoluError> {
        let (head, tail) = if requests.len() > self.max_items() {
            requests.split_at(self.max_items())
        } else {
            (requests, &[][..])
        };

        let mut items = Vec::with_capacity(head.len());
        for ts in head {
            // Requests we cannot satisfy are dropped; the peer rediscovers
            // the gap from the digest exchange.
            if let Some(ciphertext) = self.store.read_change(&self.owner, ts)? {
                items.push(EncryptedMessage::new(*ts, ciphertext));
            }
        }

        if tail.is_empty() {
            return Ok(vec![RangeEntry::new(
                range.hi,
                RangePayload::TimestampsWithChanges {
                    requests: Vec::new(),
                    items,
                    has_more: false,
                },
            )]);
        }

        let cut = head
            .last()
            .and_then(|ts| ts.successor())
            .filter(|cut| *cut < range.hi);
        match cut {
            Some(cut) => {
                let mut out = vec![RangeEntry::new(
                    cut,
                    RangePayload::TimestampsWithChanges {
                        requests: Vec::new(),
                        items,
                        has_more: false,
                    },
                )];
                // Our inventory of the remainder lets the peer re-request
                // what it still lacks.
                out.extend(self.entries_for_range(&TimestampRange::new(cut, range.hi))?);
                Ok(out)
            }
            None => Ok(vec![RangeEntry::new(
                range.hi,
                RangePayload::TimestampsWithChanges {
                    requests: Vec::new(),
                    items,
                    has_more: false,
                },
            )]),
        }
    }
}
