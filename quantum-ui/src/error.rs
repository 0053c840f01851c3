use quantum_core::channel::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UiError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("workspace is not a git repository")]
    NotARepository,
    #[error("document is not open: {0}")]
    NotOpen(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("no terminal session")]
    NoSession,
    #[error("session store: {0}")]
    Session(String),
}

pub type Result<T, E = UiError> = std::result::Result<T, E>;
