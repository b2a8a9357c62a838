use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimingError {
    #[error("clock granularity of {requested}ns is finer than the time source's {available}ns")]
    GranularityTooFine { requested: u64, available: u64 },

    #[error("failed to spawn clock thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}
