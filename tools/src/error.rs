use vbsign_api::Error as FormatError;

/// Signing-stage failures. Unlike argument parsing, these are fail-fast:
/// the first one aborts the operation and no partial output is committed.
#[derive(Debug)]
pub enum SignError {
    /// A required option is missing. The options layer catches these
    /// up front; this covers direct library use.
    BadArgs(&'static str),
    Format(FormatError),
    LayoutIncomplete(&'static str),
    RegionOverrun(&'static str),
    DevKeysRequired,
    Io(std::io::Error),
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::BadArgs(what) => write!(f, "BadArgs: {} is required", what),
            SignError::Format(e) => write!(f, "{}", e),
            SignError::LayoutIncomplete(what) => {
                write!(f, "LayoutIncomplete: image has no usable {} region", what)
            }
            SignError::RegionOverrun(what) => {
                write!(f, "RegionOverrun: {} does not fit its region", what)
            }
            SignError::DevKeysRequired => write!(
                f,
                "DevKeysRequired: FW_MAIN_A and FW_MAIN_B differ; supply --devsign and --devkeyblock"
            ),
            SignError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SignError {}

impl From<FormatError> for SignError {
    fn from(e: FormatError) -> SignError {
        SignError::Format(e)
    }
}

impl From<std::io::Error> for SignError {
    fn from(e: std::io::Error) -> SignError {
        SignError::Io(e)
    }
}
