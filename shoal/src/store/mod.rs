mod cas;
mod metadata;

pub use cas::{CacheStat, CasStore};
pub use metadata::MetadataKind;

// Not-found and already-exists are first-class outcomes of store
// operations, not faults; callers match on them.
#[derive(Debug, thiserror::Error)]
pub enum FileError {

    #[error("file not found")]
    NotFound,

    #[error("file already exists")]
    Exists,

    #[error("store invariant violated: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FileError {

    pub fn is_not_found(&self) -> bool {
        matches!(self, FileError::NotFound)
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, FileError::Exists)
    }

    // Collapse io::ErrorKind::NotFound into the typed outcome.
    fn from_io(e: std::io::Error) -> FileError {
        match e.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound,
            std::io::ErrorKind::AlreadyExists => FileError::Exists,
            _ => FileError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, FileError>;
