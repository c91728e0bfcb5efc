use thiserror::Error;

/// Error surface for the classifier core. Packet-path callers are expected
/// to catch and downgrade most of these to a neutral score rather than
/// fail the packet (see `pipeline::DnsClassifier::classify`).
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("matrix shape mismatch: {detail}")]
    ShapeMismatch { detail: String },

    #[error("character {0:?} is not in the HMM alphabet")]
    AlphabetMismatch(char),

    #[error("HMM has an empty alphabet")]
    EmptyAlphabet,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Parse(String),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, FirewallError>;
