pub mod channel;
pub mod filesystem;
pub mod git;
pub mod host;
pub mod pty;
pub mod search;
pub mod shell;
pub mod util;
