//! Reply-format negotiation for the SMC socket-diagnostics dump.
//!
//! The request carries a magic sequence number. A kernel that knows the
//! versioned reply format acknowledges with a sequence at or above the
//! ack threshold; an older kernel echoes the request sequence back
//! unchanged, which marks the whole dump as legacy.

use tracing::warn;

/// Sequence echoed by legacy kernels for version-1 requests.
pub const MAGIC_SEQ: u32 = 123456;
/// Probe sequence sent with a versioned dump request.
pub const MAGIC_SEQ_V2: u32 = 123457;
/// Replies at or above this sequence acknowledge the versioned format.
pub const MAGIC_SEQ_V2_ACK: u32 = 123458;

/// Reply format spoken by the kernel for one dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Pre-versioning format; versioned attributes must not be decoded.
    Legacy,
    /// Versioned format acknowledged by the kernel.
    Versioned,
}

/// Fixes the dialect from the first reply frame of a dump.
#[derive(Debug, Default)]
pub struct Negotiator {
    decided: Option<Dialect>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number to stamp on the dump request.
    pub fn probe_seq(&self) -> u32 {
        MAGIC_SEQ_V2
    }

    /// Observe a reply frame's sequence number.
    ///
    /// Only the first observation decides; later frames return the
    /// already-fixed dialect. Falling back to legacy logs a single
    /// notice.
    pub fn observe(&mut self, seq: u32) -> Dialect {
        if let Some(dialect) = self.decided {
            return dialect;
        }

        let dialect = if seq >= MAGIC_SEQ_V2_ACK {
            Dialect::Versioned
        } else {
            warn!("kernel replied in the legacy format, extended fields are unavailable");
            Dialect::Legacy
        };
        self.decided = Some(dialect);
        dialect
    }

    /// The dialect fixed so far, if any frame has been observed.
    pub fn dialect(&self) -> Option<Dialect> {
        self.decided
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_selects_versioned() {
        let mut neg = Negotiator::new();
        assert_eq!(neg.observe(MAGIC_SEQ_V2_ACK), Dialect::Versioned);
        assert_eq!(neg.dialect(), Some(Dialect::Versioned));
    }

    #[test]
    fn test_higher_ack_still_versioned() {
        let mut neg = Negotiator::new();
        assert_eq!(neg.observe(MAGIC_SEQ_V2_ACK + 3), Dialect::Versioned);
    }

    #[test]
    fn test_echoed_probe_selects_legacy() {
        let mut neg = Negotiator::new();
        assert_eq!(neg.observe(MAGIC_SEQ_V2), Dialect::Legacy);
    }

    #[test]
    fn test_first_frame_decides() {
        let mut neg = Negotiator::new();
        assert_eq!(neg.observe(MAGIC_SEQ), Dialect::Legacy);
        // A later frame with an ack-range sequence must not flip the dialect.
        assert_eq!(neg.observe(MAGIC_SEQ_V2_ACK), Dialect::Legacy);
    }

    #[test]
    fn test_undecided_before_first_frame() {
        assert_eq!(Negotiator::new().dialect(), None);
    }
}
