//! Smallest-free allocator for the 16-bit downstream session-id space.
//!
//! Binds every downstream miner to a stable id in `[0, 65534]` (`65535` is
//! reserved and never handed out). The id doubles as the miner's
//! extranonce1 once zero-extended to 32 bits (the extranonce1 pairing
//! lives in `downstream`, not here).

use std::fmt;

/// Number of usable session ids: `[0, MAX_SESSION_ID]`.
const MAX_SESSION_ID: u32 = 0xFFFE; // 65534, 65535 is reserved
const SESSION_SLOTS: usize = MAX_SESSION_ID as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u16);

impl SessionId {
    pub fn value(self) -> u16 {
        self.0
    }

    /// Session id zero-extended to the 32-bit extranonce1 the miner sees
    ///.
    pub fn as_extranonce1(self) -> u32 {
        self.0 as u32
    }

    /// 8-char lower-hex rendering used in the subscribe reply and in logs.
    pub fn as_hex8(self) -> String {
        format!("{:08x}", self.as_extranonce1())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// All 65535 usable ids are in use.
    Full,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Full => write!(f, "session id space exhausted"),
        }
    }
}

impl std::error::Error for AllocError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// Caller tried to free an id that is not currently allocated. This is
    /// a programmer error: uniqueness of live ids depends on every live
    /// session freeing its id exactly once.
    NotAllocated,
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::NotAllocated => write!(f, "session id was not allocated"),
        }
    }
}

impl std::error::Error for FreeError {}

/// Dense bitmap over `[0, 65534]` plus a live count. `alloc` always
/// returns the smallest free id; this is part of the contract, not an
/// implementation detail, because tests depend on it.
pub struct SessionIdAllocator {
    bits: Vec<u64>,
    count: u32,
    /// Lowest word index that might still contain a free bit below it; a
    /// hint only. Freeing an id can only move this down, never up, so a
    /// scan starting here can never skip over a free id below the hint.
    low_word_hint: usize,
}

impl SessionIdAllocator {
    pub fn new() -> Self {
        let words = SESSION_SLOTS.div_ceil(64);
        SessionIdAllocator {
            bits: vec![0u64; words],
            count: 0,
            low_word_hint: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.count as usize == SESSION_SLOTS
    }

    pub fn live_count(&self) -> u32 {
        self.count
    }

    fn test(&self, idx: u32) -> bool {
        let word = (idx / 64) as usize;
        let bit = idx % 64;
        (self.bits[word] >> bit) & 1 == 1
    }

    fn set(&mut self, idx: u32, value: bool) {
        let word = (idx / 64) as usize;
        let bit = idx % 64;
        if value {
            self.bits[word] |= 1u64 << bit;
        } else {
            self.bits[word] &= !(1u64 << bit);
        }
    }

    /// Returns the smallest unused id, marking it used. `O(65535)` worst
    /// case (a linear bitmap scan), which is acceptable given realistic
    /// miner connect rates. Deterministic smallest-first
    /// allocation is part of the contract, not an optimization detail.
    pub fn alloc(&mut self) -> Result<SessionId, AllocError> {
        if self.is_full() {
            return Err(AllocError::Full);
        }
        for word_idx in self.low_word_hint..self.bits.len() {
            let word = self.bits[word_idx];
            if word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let idx = word_idx as u32 * 64 + bit;
            if idx as usize >= SESSION_SLOTS {
                break;
            }
            self.set(idx, true);
            self.count += 1;
            self.low_word_hint = word_idx;
            return Ok(SessionId(idx as u16));
        }
        unreachable!("is_full() returned false but no free bit was found")
    }

    /// Returns `id` to the free pool. Freeing an id that isn't currently
    /// allocated is a programmer error — it would silently
    /// corrupt `count` and risk a future double-allocation, so it is
    /// reported rather than ignored.
    pub fn free(&mut self, id: SessionId) -> Result<(), FreeError> {
        let idx = id.value() as u32;
        if !self.test(idx) {
            debug_assert!(false, "freeing an unallocated session id: {}", id.value());
            return Err(FreeError::NotAllocated);
        }
        self.set(idx, false);
        self.count -= 1;
        let word_idx = (idx / 64) as usize;
        if word_idx < self.low_word_hint {
            self.low_word_hint = word_idx;
        }
        Ok(())
    }
}

impl Default for SessionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_free_allocation() {
        // Scenario 1: {0,1,2} in use, free 1, alloc -> 1, alloc -> 3.
        let mut alloc = SessionIdAllocator::new();
        let a0 = alloc.alloc().unwrap();
        let a1 = alloc.alloc().unwrap();
        let a2 = alloc.alloc().unwrap();
        assert_eq!((a0.value(), a1.value(), a2.value()), (0, 1, 2));

        alloc.free(a1).unwrap();
        let reused = alloc.alloc().unwrap();
        assert_eq!(reused.value(), 1);

        let next = alloc.alloc().unwrap();
        assert_eq!(next.value(), 3);
    }

    #[test]
    fn freeing_unallocated_id_is_an_error() {
        let mut alloc = SessionIdAllocator::new();
        let id = SessionId(42);
        assert_eq!(alloc.free(id), Err(FreeError::NotAllocated));
    }

    #[test]
    fn reports_full_at_exactly_65535() {
        let mut alloc = SessionIdAllocator::new();
        // Directly drive the counter to avoid a 65535-iteration test loop
        // spending real time; the bitmap itself isn't exercised by this
        // check, only the is_full/alloc boundary condition.
        alloc.count = SESSION_SLOTS as u32 - 1;
        alloc.bits.iter_mut().for_each(|w| *w = u64::MAX);
        // Clear exactly one bit so one alloc succeeds and then fills it.
        alloc.set(SESSION_SLOTS as u32 - 1, false);
        assert!(!alloc.is_full());
        let id = alloc.alloc().unwrap();
        assert_eq!(id.value() as u32, SESSION_SLOTS as u32 - 1);
        assert!(alloc.is_full());
        assert_eq!(alloc.alloc(), Err(AllocError::Full));
    }

    #[test]
    fn extranonce1_round_trips_hex8() {
        let id = SessionId(0x00ab);
        assert_eq!(id.as_hex8(), "000000ab");
        assert_eq!(id.as_extranonce1(), 0x00ab);
    }

    #[test]
    fn random_alloc_free_churn_never_double_issues_an_id() {
        // Invariant I-1 under a randomized mix of allocs and frees: every
        // id handed out must be unique among currently-live ids.
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut alloc = SessionIdAllocator::new();
        let mut live: Vec<SessionId> = Vec::new();

        for _ in 0..20_000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let id = alloc.alloc().unwrap();
                assert!(
                    !live.contains(&id),
                    "id {} handed out while already live",
                    id.value()
                );
                live.push(id);
            } else {
                let idx = rng.gen_range(0..live.len());
                let id = live.swap_remove(idx);
                alloc.free(id).unwrap();
            }
        }
    }
}
