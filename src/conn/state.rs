//! Per-half stream state and the composite pair view.

/// Lifecycle state of one half of the stream pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamState {
    /// No stream configured.
    #[default]
    NotConfigured,
    /// Configured toward the target, not yet opened.
    Ready,
    /// Open in flight, awaiting completion.
    Connecting,
    /// Open and usable.
    Connected,
    /// The half failed.
    Error,
}

/// The two halves together.
///
/// Composite predicates require both halves to agree; while the halves
/// disagree the pair is in none of the composite states, and lifecycle
/// fan-out never fires from such a window.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PairState {
    pub read: StreamState,
    pub write: StreamState,
}

impl PairState {
    pub(crate) fn set_both(&mut self, state: StreamState) {
        self.read = state;
        self.write = state;
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.read == StreamState::Ready && self.write == StreamState::Ready
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.read == StreamState::Connecting && self.write == StreamState::Connecting
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.read == StreamState::Connected && self.write == StreamState::Connected
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.read == StreamState::NotConfigured && self.write == StreamState::NotConfigured
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_pair_is_disconnected() {
        let pair = PairState::default();
        assert!(pair.is_disconnected());
        assert!(!pair.is_ready());
        assert!(!pair.is_connecting());
        assert!(!pair.is_connected());
    }

    #[test]
    fn composite_states_need_both_halves() {
        let mut pair = PairState::default();
        pair.read = StreamState::Connected;
        assert!(!pair.is_connected());
        assert!(!pair.is_disconnected());

        pair.write = StreamState::Connected;
        assert!(pair.is_connected());
    }

    #[test]
    fn set_both_moves_the_pair() {
        let mut pair = PairState::default();
        pair.set_both(StreamState::Ready);
        assert!(pair.is_ready());
        pair.set_both(StreamState::Connecting);
        assert!(pair.is_connecting());
    }
}
