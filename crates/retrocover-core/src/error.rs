use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or inconsistent configuration. Fatal: raised by the
    /// `validate()` methods before any compute submission.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A remote compute call failed (bad asset, quota, malformed region).
    /// Propagated as-is; the core never retries.
    #[error("remote compute call failed: {0}")]
    Compute(String),

    /// The compute backend has no raster registered under this id.
    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    /// An export submission was rejected by the sink.
    #[error("export submission failed: {0}")]
    Export(String),

    #[error("CSV serialization error: {0}")]
    Csv(#[from] csv::Error),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
