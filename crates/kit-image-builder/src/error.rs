use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

#[derive(Debug)]
pub enum Error {
    Message(String),
    /// An external tool ran and exited unsuccessfully.
    Command {
        program: String,
        code: Option<i32>,
        detail: String,
    },
    /// Checksum mismatch on an input the build trusts (e.g. the base image).
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Message(msg.into())
    }

    pub fn command(program: impl Into<String>, status: ExitStatus) -> Self {
        Self::Command {
            program: program.into(),
            code: status.code(),
            detail: status.to_string(),
        }
    }

    pub fn integrity(path: impl Into<PathBuf>, expected: &str, actual: &str) -> Self {
        Self::Integrity {
            path: path.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Wrap the message with context while keeping the error kind (and so the exit code).
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        match self {
            Self::Message(m) => Self::Message(format!("{ctx}: {m}")),
            Self::Command {
                program,
                code,
                detail,
            } => Self::Command {
                program,
                code,
                detail: format!("{ctx}: {detail}"),
            },
            other @ Self::Integrity { .. } => other,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Message(_) => 1,
            Self::Command { code, .. } => code.filter(|c| *c != 0).unwrap_or(1),
            Self::Integrity { .. } => 3,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => write!(f, "{msg}"),
            Self::Command {
                program, detail, ..
            } => write!(f, "command '{program}' failed: {detail}"),
            Self::Integrity {
                path,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch for {}: expected sha256 {expected}, got {actual}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
