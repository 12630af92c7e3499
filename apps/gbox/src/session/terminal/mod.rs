pub mod tty;

pub use tty::{
    CrosstermBackend, RawModeGuard, ResizeWatcher, TerminalBackend, TerminalController,
    TerminalError,
};
