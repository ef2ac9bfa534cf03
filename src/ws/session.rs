use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Connection lifecycle of a streaming session.
///
/// `Disconnected → Connecting → Authenticated → Subscribed`, with
/// `Reconnecting` entered on transport failure and `Closing` during a
/// cooperative shutdown. Published by the managed client through a watch
/// channel so any task can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsSessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Subscribed,
    Reconnecting,
    Closing,
}

/// Outcome of checking an inbound sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqCheck {
    InOrder,
    /// Skipped or regressed; the channel needs a fresh snapshot.
    Gap { expected: u64, got: u64 },
}

/// Active subscriptions plus per-channel sequence tracking.
///
/// Mutated only by the driver task (and serialized subscribe/unsubscribe
/// commands), never concurrently. Sequence numbers must increase by exactly
/// one per channel while subscribed; after a resubscribe or reconnect the
/// counter is reset so the next snapshot's sequence is accepted as a fresh
/// baseline.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    channels: BTreeMap<String, BTreeSet<String>>,
    last_seq: HashMap<String, u64>,
    /// Consecutive gaps per channel. A resubscribe resets the sequence
    /// counter but not the strikes; only an in-order frame that advances an
    /// established counter clears them, so a resubscribe that does not fix
    /// the stream keeps climbing until the driver escalates.
    gap_strikes: HashMap<String, u32>,
}

impl SubscriptionTable {
    /// Whether `channel` is already subscribed with every ticker in
    /// `tickers` (an empty ticker list matches any existing subscription).
    pub fn covers(&self, channel: &str, tickers: &[String]) -> bool {
        match self.channels.get(channel) {
            Some(existing) => tickers.iter().all(|t| existing.contains(t)),
            None => false,
        }
    }

    /// Record a subscription, merging tickers into an existing channel.
    pub fn record(&mut self, channel: &str, tickers: &[String]) {
        let entry = self.channels.entry(channel.to_string()).or_default();
        for ticker in tickers {
            entry.insert(ticker.clone());
        }
    }

    /// Drop tickers from a channel; an empty ticker list drops the whole
    /// channel. Channels left without tickers are removed entirely only
    /// when they were ticker-scoped to begin with.
    pub fn remove(&mut self, channel: &str, tickers: &[String]) {
        if tickers.is_empty() {
            self.channels.remove(channel);
            self.last_seq.remove(channel);
            self.gap_strikes.remove(channel);
            return;
        }
        if let Some(existing) = self.channels.get_mut(channel) {
            for ticker in tickers {
                existing.remove(ticker);
            }
            if existing.is_empty() {
                self.channels.remove(channel);
                self.last_seq.remove(channel);
                self.gap_strikes.remove(channel);
            }
        }
    }

    /// Check and advance the sequence counter for one channel.
    pub fn observe(&mut self, channel: &str, seq: u64) -> SeqCheck {
        match self.last_seq.get(channel).copied() {
            None => {
                // Fresh baseline after a reset. Strikes survive it; only an
                // in-order frame against an established counter clears them.
                self.last_seq.insert(channel.to_string(), seq);
                SeqCheck::InOrder
            }
            Some(last) if seq == last + 1 => {
                self.last_seq.insert(channel.to_string(), seq);
                self.gap_strikes.remove(channel);
                SeqCheck::InOrder
            }
            Some(last) => {
                *self.gap_strikes.entry(channel.to_string()).or_insert(0) += 1;
                SeqCheck::Gap {
                    expected: last + 1,
                    got: seq,
                }
            }
        }
    }

    /// Consecutive gaps on a channel since its last in-order frame.
    pub fn gap_strikes(&self, channel: &str) -> u32 {
        self.gap_strikes.get(channel).copied().unwrap_or(0)
    }

    /// Forget the counter for one channel (before a resubscribe). Strikes
    /// are kept so a resubscribe that does not fix the stream still counts.
    pub fn reset_seq(&mut self, channel: &str) {
        self.last_seq.remove(channel);
    }

    /// Forget all counters (after a reconnect).
    pub fn clear_seqs(&mut self) {
        self.last_seq.clear();
        self.gap_strikes.clear();
    }

    pub fn tickers(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every active (channel, tickers) subscription, for resubscribing
    /// after a reconnect.
    pub fn active(&self) -> Vec<(String, Vec<String>)> {
        self.channels
            .iter()
            .map(|(channel, tickers)| (channel.clone(), tickers.iter().cloned().collect()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
