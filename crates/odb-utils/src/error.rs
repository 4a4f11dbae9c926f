/// Base error type for odb-utils operations.
#[derive(Debug, thiserror::Error)]
pub enum UtilError {
    #[error("malformed quoted string at byte {position}")]
    BadQuoting { position: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
