// src/types.rs

pub type Hash = [u8; 32];

pub type ValidatorId = u32;

/// Largest UDP payload a validator will send or accept.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Per-validator protocol phase.
///
/// The happy path per block is Idle -> Prepared -> Committed -> Final.
/// The pipelined variant folds a block's Commit phase into the next
/// block's Prepare phase: CommitPrepared -> FinalPrepared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Prepared,
    Committed,
    Final,
    CommitPrepared,
    FinalPrepared,
}

/// Which phase schedule a validator set runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseMode {
    /// Two round trips per block: Prepare then Commit.
    Standard,
    /// One round trip per block: CommitPrepare piggybacks the previous
    /// block's Commit quorum onto the next block's Prepare round.
    CommitPrepare,
}

impl PhaseMode {
    pub fn pipelined(self) -> bool {
        matches!(self, PhaseMode::CommitPrepare)
    }
}
