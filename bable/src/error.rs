pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("mmap error: {0}")]
    Mmap(#[from] fmmap::error::Error),
    #[error("checksum mismatch: expected {expected}, actual {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("table {id} is corrupted: {reason}")]
    Corrupted { id: u64, reason: &'static str },
    #[error("cannot build a table without entries")]
    EmptyTable,
}
