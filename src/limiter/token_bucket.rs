/// Byte-denominated token bucket refilled in fixed increments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    capacity: u64,
    available: u64,
    refill_amount: u64,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_amount: u64, initial: u64) -> Self {
        Self {
            capacity,
            available: initial.min(capacity),
            refill_amount,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    /// Take up to `wanted` tokens, returning how many were taken.
    pub fn consume_up_to(&mut self, wanted: u64) -> u64 {
        let taken = wanted.min(self.available);
        self.available -= taken;
        taken
    }

    /// Add one refill increment, capped at capacity.
    pub fn refill(&mut self) {
        self.available = self
            .available
            .saturating_add(self.refill_amount)
            .min(self.capacity);
    }
}
