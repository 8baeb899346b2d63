pub mod crypto;
pub mod fmap;
pub mod gbb;
pub mod keyblock;
pub mod preamble;
mod wire;

pub use crypto::{Algorithm, PrivateKey, PublicKey, Signer};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::crypto::{Algorithm, PrivateKey};

    pub fn private_key(algorithm: Algorithm) -> PrivateKey {
        let rsa = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), algorithm.rsa_bits())
            .expect("keygen failed");
        PrivateKey::from_rsa(rsa, algorithm).unwrap()
    }
}

/// Errors produced while loading key material or parsing/building the
/// verified-boot structures. Structural problems carry a short tag naming
/// the structure that failed, so the CLI can print something actionable
/// without threading context strings through every call site.
#[derive(Debug)]
pub enum Error {
    BadKey(String),
    AlgoMismatch(String),
    BadSignature,
    BadAlgorithm(u64),
    BadMagic(&'static str),
    Truncated(&'static str),
    FmapNotFound,
    GbbFull(&'static str),
    UnsupportedField(&'static str),
    ExternalSignerFailed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BadKey(m) => write!(f, "bad key material: {}", m),
            Error::AlgoMismatch(m) => write!(f, "algorithm mismatch: {}", m),
            Error::BadSignature => write!(f, "signature verification failed"),
            Error::BadAlgorithm(id) => write!(f, "unknown algorithm id {}", id),
            Error::BadMagic(what) => write!(f, "{}: bad magic", what),
            Error::Truncated(what) => write!(f, "{}: structure exceeds buffer", what),
            Error::FmapNotFound => write!(f, "no FMAP signature found in image"),
            Error::GbbFull(what) => write!(f, "GBB: {} does not fit in reserved space", what),
            Error::UnsupportedField(what) => {
                write!(f, "GBB: header version too old for {}", what)
            }
            Error::ExternalSignerFailed(m) => write!(f, "external signer failed: {}", m),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}
