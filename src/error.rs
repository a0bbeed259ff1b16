//! Error types for parsing, compilation and execution.

use std::fmt;

use thiserror::Error;

/// A source position: symbolic source name plus a 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcPos {
    pub name: Option<String>,
    pub line: usize,
}

impl SrcPos {
    pub fn new(name: Option<String>, line: usize) -> Self {
        Self { name, line }
    }
}

impl fmt::Display for SrcPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}:{}", name, self.line),
            None => write!(f, "{}", self.line),
        }
    }
}

/// Errors raised while turning source text into bytecode.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}: missing \"{1}\"")]
    MissingBracket(SrcPos, char),

    #[error("{0}: unexpected \"{1}\"")]
    UnexpectedBracket(SrcPos, char),

    #[error("{0}: too many @s")]
    TooManyAts(SrcPos),

    #[error("{0}: unterminated string")]
    UnterminatedString(SrcPos),

    #[error("{0}: invalid escape sequence '\\{1}'")]
    InvalidEscape(SrcPos, char),

    #[error("{0}: invalid line break")]
    InvalidLineBreak(SrcPos),

    #[error("{0}: {1}")]
    General(SrcPos, String),
}

impl ParseError {
    pub fn general(pos: SrcPos, message: impl Into<String>) -> Self {
        Self::General(pos, message.into())
    }

    pub fn pos(&self) -> &SrcPos {
        match self {
            Self::MissingBracket(pos, _)
            | Self::UnexpectedBracket(pos, _)
            | Self::TooManyAts(pos)
            | Self::UnterminatedString(pos)
            | Self::InvalidEscape(pos, _)
            | Self::InvalidLineBreak(pos)
            | Self::General(pos, _) => pos,
        }
    }
}

/// One entry of the alias call stack captured when an error is raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub index: usize,
    pub name: String,
}

/// Errors raised while executing bytecode.
///
/// `Break` and `Continue` ride the error rails so that loop commands can
/// catch them; if either escapes every loop it is reported as broken
/// control flow by the outer run entry points.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("break outside loop")]
    Break,

    #[error("continue outside loop")]
    Continue,

    #[error("{message}")]
    Error {
        message: String,
        trace: Vec<TraceFrame>,
    },
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_trace(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        Self::Error {
            message: message.into(),
            trace,
        }
    }

    /// Whether this is a `break`/`continue` unwind rather than a real error.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Break | Self::Continue)
    }

    pub fn trace(&self) -> &[TraceFrame] {
        match self {
            Self::Error { trace, .. } => trace,
            _ => &[],
        }
    }
}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum CubeError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Run(#[from] RuntimeError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl CubeError {
    /// Whether this is a `break`/`continue` unwind.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Run(e) if e.is_control())
    }

    /// Turn an escaped `break`/`continue` into a reportable runtime error.
    pub fn demote_control(self) -> Self {
        match self {
            Self::Run(RuntimeError::Break) => {
                Self::Run(RuntimeError::new("break outside loop"))
            }
            Self::Run(RuntimeError::Continue) => {
                Self::Run(RuntimeError::new("continue outside loop"))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_carries_position() {
        let err = ParseError::TooManyAts(SrcPos::new(Some("boot.cfg".into()), 7));
        assert_eq!(err.to_string(), "boot.cfg:7: too many @s");
        assert_eq!(err.pos().line, 7);
    }

    #[test]
    fn position_without_name() {
        let err = ParseError::UnterminatedString(SrcPos::new(None, 3));
        assert_eq!(err.to_string(), "3: unterminated string");
    }

    #[test]
    fn control_errors_demote() {
        let err = CubeError::from(RuntimeError::Break);
        assert!(err.is_control());
        assert_eq!(err.demote_control().to_string(), "break outside loop");
    }
}
