#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Not enough data")]
    NotEnoughData { actual: usize, minimum: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A pipe was written past its capacity.
    #[error("Overflow")]
    Overflow,

    /// The requested configuration cannot be realized. The demodulator stays unconfigured.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The external soft-decision LDPC helper failed.
    #[error("LDPC helper error: {0}")]
    Delegate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
