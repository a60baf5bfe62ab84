use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Source file missing, unreadable or structurally malformed
    ModelLoad(String),
    /// Valid file that uses a feature this compiler refuses
    UnsupportedOption(String),
    /// Shape/rank/topology invariant violated while building the graph
    InvalidGraph(String),
    /// The emitter hit an unimplemented fast path or the assembler failed
    Compile(String),
    /// The host CPU lacks an extension required by the requested code
    RuntimeFeatureMissing(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ModelLoad(msg) => write!(f, "model load error: {msg}"),
            Error::UnsupportedOption(msg) => write!(f, "unsupported option: {msg}"),
            Error::InvalidGraph(msg) => write!(f, "invalid graph: {msg}"),
            Error::Compile(msg) => write!(f, "compile error: {msg}"),
            Error::RuntimeFeatureMissing(msg) => write!(f, "runtime feature missing: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<iced_x86::IcedError> for Error {
    fn from(e: iced_x86::IcedError) -> Self {
        Error::Compile(format!("assembler: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ModelLoad(e.to_string())
    }
}
