/// Represents errors that can occur in the value store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// No live entry exists for the key.
    ///
    /// `timestamp_bits` is the raw timestamp of whatever marker is known for
    /// the key: `0` if the key was never seen, otherwise the timestamp of the
    /// deletion or local-removal marker that shadows it.
    NotFound {
        /// Raw timestamp bits of the shadowing marker (0 = never existed)
        timestamp_bits: u64,
    },

    /// The value exceeds the configured `value_cap`
    ValueTooLarge,

    /// A checksummed span failed verification
    Corrupt,

    /// Writes are currently disabled
    Disabled,

    /// Invalid values/TOC file format version
    InvalidVersion(u32),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValueStoreError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl Error {
    /// Returns `true` for [`Error::NotFound`]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Value store result
pub type Result<T> = std::result::Result<T, Error>;
