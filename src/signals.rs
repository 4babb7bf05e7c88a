//! Signals that end a foreground session.
//!
//! Handlers are registered by [`ShutdownSignals::install`], so a signal that
//! arrives before anyone awaits [`ShutdownSignals::recv`] is still seen and
//! the default action (terminate without cleanup) never runs.

use std::io;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

#[cfg(unix)]
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "interrupt",
            _ = self.terminate.recv() => "terminate",
            _ = self.hangup.recv() => "hangup",
        }
    }
}

#[cfg(windows)]
use tokio::signal::windows;

/// Console events: Ctrl-C, the console window closing, logoff and system
/// shutdown.
#[cfg(windows)]
pub struct ShutdownSignals {
    ctrl_c: windows::CtrlC,
    close: windows::CtrlClose,
    logoff: windows::CtrlLogoff,
    shutdown: windows::CtrlShutdown,
}

#[cfg(windows)]
impl ShutdownSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            ctrl_c: windows::ctrl_c()?,
            close: windows::ctrl_close()?,
            logoff: windows::ctrl_logoff()?,
            shutdown: windows::ctrl_shutdown()?,
        })
    }

    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.ctrl_c.recv() => "ctrl-c",
            _ = self.close.recv() => "console close",
            _ = self.logoff.recv() => "logoff",
            _ = self.shutdown.recv() => "system shutdown",
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn raise(signals: &mut ShutdownSignals, signum: libc::c_int) -> &'static str {
        // SAFETY: signalling our own pid; handlers are installed above.
        unsafe { libc::kill(libc::getpid(), signum) };
        tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn terminate_and_hangup_are_caught() {
        let mut signals = ShutdownSignals::install().unwrap();
        assert_eq!(raise(&mut signals, libc::SIGTERM).await, "terminate");
        assert_eq!(raise(&mut signals, libc::SIGHUP).await, "hangup");
    }
}
