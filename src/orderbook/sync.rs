//! Snapshot/stream reconciliation
//!
//! Follows the exchange's local order book procedure: buffer the stream,
//! seed from a snapshot, find the update that straddles the snapshot's
//! `lastUpdateId`, then require every later update's `pu` to equal the
//! previous `u`. Any break means the book can no longer be trusted and the
//! whole procedure starts over.

use std::fmt;

use super::{DepthUpdateBuffer, OrderBook};
use crate::parser::{DepthSnapshot, DepthUpdate};

/// Reconciliation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No usable snapshot; updates are being buffered
    Unsynced,
    /// Snapshot applied, looking for the bridging update
    Scanning,
    /// Applying live updates as they arrive
    Synced,
}

/// Why the local book had to be thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gap {
    /// An update's `pu` did not match the last applied `u`
    ChainBreak { expected: u64, got: Option<u64> },
    /// The stream already moved past the snapshot without a bridging update
    SnapshotBehind {
        last_update_id: u64,
        first_update_id: u64,
    },
}

impl Gap {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Gap::ChainBreak { .. } => "chain_break",
            Gap::SnapshotBehind { .. } => "snapshot_behind",
        }
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gap::ChainBreak {
                expected,
                got: Some(got),
            } => write!(f, "expected pu {expected}, got {got}"),
            Gap::ChainBreak { expected, got: None } => {
                write!(f, "expected pu {expected}, got none")
            }
            Gap::SnapshotBehind {
                last_update_id,
                first_update_id,
            } => write!(
                f,
                "snapshot at {last_update_id} is behind stream starting at {first_update_id}"
            ),
        }
    }
}

/// Result of feeding the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Retained for a later scan; the book was not touched
    Buffered,
    /// The bridging update was found and `applied` buffered updates folded in
    Bridged { cursor: u64, applied: usize },
    /// A live update was applied
    Applied { cursor: u64 },
    /// Sequence gap; a fresh snapshot is required
    Resync(Gap),
}

/// Reconciliation state machine for one symbol
#[derive(Debug)]
pub struct DepthSync {
    buffer: DepthUpdateBuffer<DepthUpdate>,
    state: SyncState,
    /// `u` of the last update folded into the book (or the snapshot id)
    cursor: Option<u64>,
    scan_window: usize,
}

impl DepthSync {
    /// Start unsynced, retaining up to `scan_window` updates
    pub fn new(scan_window: usize) -> Self {
        Self {
            buffer: DepthUpdateBuffer::new(scan_window),
            state: SyncState::Unsynced,
            cursor: None,
            scan_window,
        }
    }

    /// Seed the book from a snapshot and scan what was buffered meanwhile
    pub fn seed(&mut self, book: &mut OrderBook, snapshot: &DepthSnapshot) -> SyncOutcome {
        book.reset(snapshot);
        self.cursor = Some(snapshot.last_update_id);
        self.state = SyncState::Scanning;
        self.scan(book)
    }

    /// Feed one update in arrival order
    pub fn on_event(&mut self, book: &mut OrderBook, event: DepthUpdate) -> SyncOutcome {
        match self.state {
            SyncState::Unsynced => {
                self.buffer.push(event);
                SyncOutcome::Buffered
            }
            SyncState::Scanning => {
                self.buffer.push(event);
                self.scan(book)
            }
            SyncState::Synced => self.advance(book, event),
        }
    }

    /// Drop the buffer and the cursor; the next snapshot starts over
    pub fn invalidate(&mut self) {
        self.state = SyncState::Unsynced;
        self.cursor = None;
        self.buffer.set_limit(self.scan_window);
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Access to the update buffer, e.g. to attach observers
    pub fn buffer_mut(&mut self) -> &mut DepthUpdateBuffer<DepthUpdate> {
        &mut self.buffer
    }

    fn advance(&mut self, book: &mut OrderBook, event: DepthUpdate) -> SyncOutcome {
        match self.cursor {
            Some(expected) if event.previous_final_update_id == Some(expected) => {
                book.apply_update(&event);
                let cursor = event.final_update_id;
                self.cursor = Some(cursor);
                self.buffer.push(event);
                SyncOutcome::Applied { cursor }
            }
            expected => {
                let gap = Gap::ChainBreak {
                    expected: expected.unwrap_or_default(),
                    got: event.previous_final_update_id,
                };
                self.invalidate();
                SyncOutcome::Resync(gap)
            }
        }
    }

    fn scan(&mut self, book: &mut OrderBook) -> SyncOutcome {
        let Some(snapshot_id) = self.cursor else {
            return SyncOutcome::Buffered;
        };

        let window = self.buffer.limit();
        let events = self.buffer.events();
        let bridge = events
            .iter()
            .position(|e| e.first_update_id <= snapshot_id && e.final_update_id >= snapshot_id);

        let Some(start) = bridge else {
            // Keep accumulating until a full scan window has gone by without
            // a bridge; only then is a stream already past the snapshot a gap.
            if events.len() < window {
                return SyncOutcome::Buffered;
            }
            let ahead = events
                .iter()
                .find(|e| e.first_update_id > snapshot_id)
                .map(|e| e.first_update_id);

            return match ahead {
                Some(first_update_id) => {
                    self.invalidate();
                    SyncOutcome::Resync(Gap::SnapshotBehind {
                        last_update_id: snapshot_id,
                        first_update_id,
                    })
                }
                None => SyncOutcome::Buffered,
            };
        };

        let mut cursor = snapshot_id;
        let mut applied = 0;
        let mut broken = None;

        for (i, event) in events[start..].iter().enumerate() {
            if i > 0 && event.previous_final_update_id != Some(cursor) {
                broken = Some(Gap::ChainBreak {
                    expected: cursor,
                    got: event.previous_final_update_id,
                });
                break;
            }
            book.apply_update(event);
            cursor = event.final_update_id;
            applied += 1;
        }

        if let Some(gap) = broken {
            self.invalidate();
            return SyncOutcome::Resync(gap);
        }

        self.cursor = Some(cursor);
        self.state = SyncState::Synced;
        self.buffer.set_limit(1);

        SyncOutcome::Bridged { cursor, applied }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::Side;
    use crate::parser::PriceLevel;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn levels(pairs: &[(i64, i64)]) -> Vec<PriceLevel> {
        pairs
            .iter()
            .map(|(p, q)| PriceLevel::new(Decimal::from(*p), Decimal::from(*q)))
            .collect()
    }

    fn event(
        first: u64,
        last: u64,
        pu: Option<u64>,
        bids: &[(i64, i64)],
        asks: &[(i64, i64)],
    ) -> DepthUpdate {
        DepthUpdate {
            event_type: "depthUpdate".to_string(),
            event_time: last,
            transaction_time: last,
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            previous_final_update_id: pu,
            bids: levels(bids),
            asks: levels(asks),
        }
    }

    fn snapshot(last_update_id: u64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id,
            bids: levels(&[(100, 5)]),
            asks: levels(&[(101, 5)]),
        }
    }

    fn synced() -> (DepthSync, OrderBook) {
        let mut sync = DepthSync::new(100);
        let mut book = OrderBook::new("BTCUSDT");
        sync.seed(&mut book, &snapshot(10));
        let outcome = sync.on_event(&mut book, event(8, 12, None, &[(100, 7)], &[]));
        assert_eq!(outcome, SyncOutcome::Bridged { cursor: 12, applied: 1 });
        (sync, book)
    }

    #[test]
    fn test_bridge_then_follow_up() {
        let (mut sync, mut book) = synced();
        assert_eq!(sync.state(), SyncState::Synced);
        assert_eq!(sync.cursor(), Some(12));
        assert_eq!(book.quantity_at(Side::Bid, dec!(100)), Some(dec!(7)));

        let outcome = sync.on_event(&mut book, event(13, 14, Some(12), &[(100, 0)], &[(101, 3)]));
        assert_eq!(outcome, SyncOutcome::Applied { cursor: 14 });
        assert!(book.side(Side::Bid).is_empty());
        assert_eq!(book.quantity_at(Side::Ask, dec!(101)), Some(dec!(3)));
        assert_eq!(book.depth(), (0, 1));
    }

    #[test]
    fn test_chain_break_requests_resync() {
        let (mut sync, mut book) = synced();

        let outcome = sync.on_event(&mut book, event(13, 14, Some(11), &[(100, 0)], &[]));
        assert_eq!(
            outcome,
            SyncOutcome::Resync(Gap::ChainBreak {
                expected: 12,
                got: Some(11)
            })
        );
        assert_eq!(sync.state(), SyncState::Unsynced);
        assert_eq!(sync.cursor(), None);
        assert_eq!(sync.buffered(), 0);
        // The broken update must not have touched the book
        assert_eq!(book.quantity_at(Side::Bid, dec!(100)), Some(dec!(7)));
    }

    #[test]
    fn test_missing_pu_while_synced_is_a_gap() {
        let (mut sync, mut book) = synced();
        let outcome = sync.on_event(&mut book, event(13, 14, None, &[], &[]));
        assert!(matches!(outcome, SyncOutcome::Resync(Gap::ChainBreak { got: None, .. })));
    }

    #[test]
    fn test_updates_buffered_before_snapshot_are_scanned() {
        let mut sync = DepthSync::new(100);
        let mut book = OrderBook::new("BTCUSDT");

        assert_eq!(
            sync.on_event(&mut book, event(1, 5, None, &[(99, 1)], &[])),
            SyncOutcome::Buffered
        );
        sync.on_event(&mut book, event(6, 9, Some(5), &[(98, 1)], &[]));
        sync.on_event(&mut book, event(10, 12, Some(9), &[(100, 7)], &[]));
        sync.on_event(&mut book, event(13, 15, Some(12), &[], &[(102, 2)]));
        assert!(book.is_empty());

        let outcome = sync.seed(&mut book, &snapshot(11));
        assert_eq!(outcome, SyncOutcome::Bridged { cursor: 15, applied: 2 });

        // Only the updates past the snapshot are reflected
        assert_eq!(book.quantity_at(Side::Bid, dec!(99)), None);
        assert_eq!(book.quantity_at(Side::Bid, dec!(98)), None);
        assert_eq!(book.quantity_at(Side::Bid, dec!(100)), Some(dec!(7)));
        assert_eq!(book.quantity_at(Side::Ask, dec!(102)), Some(dec!(2)));
        assert_eq!(book.last_update_id(), 15);
    }

    #[test]
    fn test_convergence_matches_direct_application() {
        let stream = vec![
            event(1, 4, None, &[(97, 1)], &[]),
            event(5, 8, Some(4), &[(98, 2)], &[(105, 1)]),
            event(9, 11, Some(8), &[(99, 3)], &[(101, 0)]),
            event(12, 13, Some(11), &[(100, 0)], &[(104, 6)]),
            event(14, 20, Some(13), &[(99, 1), (96, 4)], &[(105, 0)]),
        ];

        let mut sync = DepthSync::new(100);
        let mut book = OrderBook::new("BTCUSDT");
        sync.seed(&mut book, &snapshot(10));
        for e in stream.iter().cloned() {
            sync.on_event(&mut book, e);
        }
        assert_eq!(sync.state(), SyncState::Synced);

        let mut expected = OrderBook::new("BTCUSDT");
        expected.reset(&snapshot(10));
        for e in stream.iter().filter(|e| e.final_update_id >= 10) {
            expected.apply_update(e);
        }

        let (got, want) = (book.levels(), expected.levels());
        assert_eq!(got.bids, want.bids);
        assert_eq!(got.asks, want.asks);
        assert_eq!(got.last_update_id, 20);
    }

    #[test]
    fn test_stale_updates_keep_scanning() {
        let mut sync = DepthSync::new(100);
        let mut book = OrderBook::new("BTCUSDT");
        sync.seed(&mut book, &snapshot(50));

        let outcome = sync.on_event(&mut book, event(10, 20, None, &[(100, 9)], &[]));
        assert_eq!(outcome, SyncOutcome::Buffered);
        assert_eq!(sync.state(), SyncState::Scanning);
        assert_eq!(book.quantity_at(Side::Bid, dec!(100)), Some(dec!(5)));
    }

    #[test]
    fn test_snapshot_behind_stream_waits_for_full_window() {
        let mut sync = DepthSync::new(3);
        let mut book = OrderBook::new("BTCUSDT");
        sync.on_event(&mut book, event(20, 25, Some(19), &[], &[]));

        // One update past the snapshot is not enough to give up yet
        assert_eq!(sync.seed(&mut book, &snapshot(10)), SyncOutcome::Buffered);
        assert_eq!(sync.state(), SyncState::Scanning);
        assert_eq!(
            sync.on_event(&mut book, event(26, 30, Some(25), &[], &[])),
            SyncOutcome::Buffered
        );

        let outcome = sync.on_event(&mut book, event(31, 35, Some(30), &[], &[]));
        assert_eq!(
            outcome,
            SyncOutcome::Resync(Gap::SnapshotBehind {
                last_update_id: 10,
                first_update_id: 20
            })
        );
        assert_eq!(sync.state(), SyncState::Unsynced);
        assert_eq!(sync.buffered(), 0);
    }

    #[test]
    fn test_full_window_of_stale_updates_keeps_scanning() {
        let mut sync = DepthSync::new(2);
        let mut book = OrderBook::new("BTCUSDT");
        sync.seed(&mut book, &snapshot(50));

        sync.on_event(&mut book, event(10, 20, None, &[], &[]));
        let outcome = sync.on_event(&mut book, event(21, 30, Some(20), &[], &[]));
        assert_eq!(outcome, SyncOutcome::Buffered);
        assert_eq!(sync.state(), SyncState::Scanning);
    }

    #[test]
    fn test_break_after_bridge_in_buffer() {
        let mut sync = DepthSync::new(100);
        let mut book = OrderBook::new("BTCUSDT");
        sync.on_event(&mut book, event(8, 12, None, &[], &[]));
        sync.on_event(&mut book, event(14, 15, Some(13), &[], &[]));

        let outcome = sync.seed(&mut book, &snapshot(10));
        assert!(matches!(
            outcome,
            SyncOutcome::Resync(Gap::ChainBreak {
                expected: 12,
                got: Some(13)
            })
        ));
    }

    #[test]
    fn test_synced_buffer_is_passthrough() {
        let (mut sync, mut book) = synced();
        assert_eq!(sync.buffer_mut().limit(), 1);
        sync.on_event(&mut book, event(13, 14, Some(12), &[], &[]));
        sync.on_event(&mut book, event(15, 16, Some(14), &[], &[]));
        assert_eq!(sync.buffered(), 1);
        assert_eq!(sync.buffer_mut().latest().map(|e| e.final_update_id), Some(16));
    }

    #[test]
    fn test_invalidate_restores_scan_window() {
        let (mut sync, _) = synced();
        sync.invalidate();
        assert_eq!(sync.state(), SyncState::Unsynced);
        assert_eq!(sync.buffer_mut().limit(), 100);
    }

    #[test]
    fn test_gap_reason_labels() {
        let gap = Gap::ChainBreak {
            expected: 12,
            got: Some(11),
        };
        assert_eq!(gap.reason(), "chain_break");
        assert_eq!(gap.to_string(), "expected pu 12, got 11");
    }
}
