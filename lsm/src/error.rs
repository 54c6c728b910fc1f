pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("table error: {0}")]
    Table(#[from] bable::error::Error),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    /// The manifest rejected a batch of edits, nothing of the batch was applied.
    #[error("manifest error: {0}")]
    Manifest(std::io::Error),
    /// No plan could be built for a priority. Workers skip it silently.
    #[error("unable to fill tables")]
    FillTables,
    #[error("table {0} is listed in the manifest but its file is missing")]
    TableNotFound(u64),
    #[error("table {id} is listed at level {level}, beyond the configured levels")]
    LevelOutOfRange { id: u64, level: usize },
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
}
