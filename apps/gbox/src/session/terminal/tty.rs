use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::TermSize;

/// Platform hooks behind the controller. The real implementation drives the
/// process terminal through crossterm; tests substitute their own.
pub trait TerminalBackend: Send + Sync {
    fn is_terminal(&self) -> bool;
    /// Returns `(columns, rows)`.
    fn size(&self) -> io::Result<(u16, u16)>;
    fn enable_raw(&self) -> io::Result<()>;
    fn disable_raw(&self) -> io::Result<()>;
}

pub struct CrosstermBackend;

impl TerminalBackend for CrosstermBackend {
    fn is_terminal(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        crossterm::terminal::size()
    }

    fn enable_raw(&self) -> io::Result<()> {
        crossterm::terminal::enable_raw_mode()
    }

    fn disable_raw(&self) -> io::Result<()> {
        crossterm::terminal::disable_raw_mode()
    }
}

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("not a terminal")]
    NotATerminal,
    #[error("terminal is already in raw mode for another session")]
    AlreadyRaw,
    #[error("failed to query terminal size: {0}")]
    Size(#[source] io::Error),
    #[error("failed to set terminal to raw mode: {0}")]
    EnterRaw(#[source] io::Error),
}

static PROCESS_TERMINAL: LazyLock<TerminalController> =
    LazyLock::new(|| TerminalController::with_backend(Arc::new(CrosstermBackend)));

/// Owns the raw/cooked switch for one terminal. Only one [`RawModeGuard`]
/// can be alive per controller at a time.
#[derive(Clone)]
pub struct TerminalController {
    backend: Arc<dyn TerminalBackend>,
    raw_held: Arc<AtomicBool>,
}

impl TerminalController {
    /// The controller for this process's own terminal.
    pub fn process() -> Self {
        PROCESS_TERMINAL.clone()
    }

    pub fn with_backend(backend: Arc<dyn TerminalBackend>) -> Self {
        Self {
            backend,
            raw_held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.backend.is_terminal()
    }

    pub fn query_size(&self) -> Result<TermSize, TerminalError> {
        if !self.backend.is_terminal() {
            return Err(TerminalError::NotATerminal);
        }
        let (width, height) = self.backend.size().map_err(TerminalError::Size)?;
        Ok(TermSize { height, width })
    }

    /// Switches to raw mode; the returned guard restores the previous mode
    /// when dropped.
    pub fn enter_raw(&self) -> Result<RawModeGuard, TerminalError> {
        if self
            .raw_held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TerminalError::AlreadyRaw);
        }
        if let Err(err) = self.backend.enable_raw() {
            self.raw_held.store(false, Ordering::Release);
            return Err(TerminalError::EnterRaw(err));
        }
        debug!("terminal switched to raw mode");
        Ok(RawModeGuard {
            backend: Arc::clone(&self.backend),
            raw_held: Arc::clone(&self.raw_held),
        })
    }

    pub fn watch_resize(&self) -> ResizeWatcher {
        ResizeWatcher::new(self.clone())
    }
}

pub struct RawModeGuard {
    backend: Arc<dyn TerminalBackend>,
    raw_held: Arc<AtomicBool>,
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = self.backend.disable_raw() {
            warn!(error = %err, "failed to restore terminal mode");
        } else {
            debug!("terminal mode restored");
        }
        self.raw_held.store(false, Ordering::Release);
    }
}

/// Yields the new terminal size each time the window changes. On platforms
/// without SIGWINCH it never yields.
pub struct ResizeWatcher {
    controller: TerminalController,
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl ResizeWatcher {
    fn new(controller: TerminalController) -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let signal = match signal(SignalKind::window_change()) {
                Ok(signal) => Some(signal),
                Err(err) => {
                    debug!(error = %err, "resize notifications unavailable");
                    None
                }
            };
            Self { controller, signal }
        }
        #[cfg(not(unix))]
        {
            Self { controller }
        }
    }

    /// Returns `None` once no further notifications can arrive.
    pub async fn changed(&mut self) -> Option<TermSize> {
        #[cfg(unix)]
        {
            let signal = self.signal.as_mut()?;
            loop {
                signal.recv().await?;
                match self.controller.query_size() {
                    Ok(size) => return Some(size),
                    Err(err) => debug!(error = %err, "ignoring resize without a readable size"),
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = &self.controller;
            None
        }
    }
}
