/// How eagerly busy-waits are recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Consecutive reads of one word before it counts as a busy-wait
    pub threshold: u32,
    /// Most instructions fetched between two of those reads
    pub max_gap: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            threshold: 64,
            max_gap: 32,
        }
    }
}

/// Recognises a tight loop that keeps reading the same word without writing anything.
///
/// Any store, a read of a different word, or too many instructions between reads starts the
/// count over. So does `clear`, which the CPU calls on interrupts.
#[derive(Debug)]
pub struct PollDetector {
    config: PollConfig,
    candidate: Option<u32>,
    count: u32,
    gap: u32,
}

impl PollDetector {
    pub fn new(config: PollConfig) -> PollDetector {
        PollDetector {
            config,
            candidate: None,
            count: 0,
            gap: 0,
        }
    }

    #[inline(always)]
    pub fn fetch(&mut self) {
        self.gap = self.gap.saturating_add(1);
    }

    /// Records a read of the word at `physical`. True once it has been read often enough to call
    /// it a busy-wait, and for every read after that until the count starts over.
    pub fn read(&mut self, physical: u32) -> bool {
        let word = physical & !3;
        let gap = std::mem::take(&mut self.gap);
        if self.candidate == Some(word) && gap <= self.config.max_gap {
            self.count = self.count.saturating_add(1);
        } else {
            self.candidate = Some(word);
            self.count = 1;
        }
        self.count >= self.config.threshold
    }

    pub fn write(&mut self) {
        self.clear();
    }

    pub fn clear(&mut self) {
        self.candidate = None;
        self.count = 0;
        self.gap = 0;
    }

    pub fn candidate(&self) -> Option<u32> {
        self.candidate
    }
}
