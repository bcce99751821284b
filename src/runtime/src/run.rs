//! Running a container to completion.
//!
//! [`RunCoordinator::run_container`] races three activities: the attach
//! stream, the wait for exit, and the interrupt signal. Whichever settles
//! first decides the outcome:
//!
//! 1. attach is spawned and must report readiness before the container is
//!    started, so no early output is lost;
//! 2. the wait task yields the exit status and marks the run finished;
//! 3. an interrupt removes the container and ends the run with
//!    [`KilnError::Interrupted`].
//!
//! Attach errors that arrive after the run finished are logged and dropped,
//! and an interrupt takes precedence over an attach error seen at the same
//! time.

use crate::engine::EngineClient;
use futures::future::BoxFuture;
use kiln_core::error::{short_id, KilnError, Result};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// How long to keep relaying output after a non-interactive container exits.
const ATTACH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces a future that resolves when the user interrupts the build.
pub type InterruptSource = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Ctrl-C. If the handler cannot be installed the future never resolves.
pub fn ctrl_c() -> InterruptSource {
    Arc::new(|| {
        Box::pin(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for interrupt");
                std::future::pending::<()>().await;
            }
        })
    })
}

/// Restores the terminal when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            tracing::warn!(error = %e, "Failed to restore terminal");
        }
    }
}

/// Starts, attaches to and waits for build containers.
pub struct RunCoordinator {
    client: Arc<dyn EngineClient>,
    interrupt: InterruptSource,
}

impl RunCoordinator {
    pub fn new(client: Arc<dyn EngineClient>) -> Self {
        Self {
            client,
            interrupt: ctrl_c(),
        }
    }

    /// Replace the interrupt source (Ctrl-C by default).
    pub fn with_interrupt(mut self, interrupt: InterruptSource) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run a created container until it exits.
    ///
    /// With `attach_stdin` the local terminal is switched to raw mode and
    /// wired to the container; stdin must be a terminal.
    pub async fn run_container(&self, id: &str, attach_stdin: bool) -> Result<()> {
        let _raw = if attach_stdin {
            tracing::info!("| Attach stdin to the container {}", short_id(id));
            if !std::io::stdin().is_terminal() {
                return Err(KilnError::AttachError(
                    "Cannot attach to a container on non tty input".to_string(),
                ));
            }
            Some(RawModeGuard::enable()?)
        } else {
            None
        };

        let (finished_tx, finished_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (attach_err_tx, mut attach_err_rx) = oneshot::channel::<KilnError>();

        let mut attach = {
            let client = self.client.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = client.attach_container(&id, attach_stdin, ready_tx).await {
                    if *finished_rx.borrow() {
                        tracing::debug!(container = short_id(&id), error = %e, "Ignoring attach error after exit");
                    } else {
                        let _ = attach_err_tx.send(e);
                    }
                }
            })
        };

        let mut interrupt = (self.interrupt)();

        // Start only once the attach connection is up
        tokio::select! {
            ready = ready_rx => {
                if ready.is_err() {
                    let err = match (&mut attach_err_rx).await {
                        Ok(e) => e,
                        Err(_) => KilnError::AttachError(format!(
                            "attach to {} ended before it was ready",
                            short_id(id)
                        )),
                    };
                    return Err(err);
                }
            }
            _ = &mut interrupt => {
                attach.abort();
                self.remove_interrupted(id).await;
                return Err(KilnError::Interrupted);
            }
        }

        if let Err(e) = self.client.start_container(id).await {
            attach.abort();
            return Err(e);
        }

        let resize = attach_stdin.then(|| spawn_resize_watcher(self.client.clone(), id.to_string()));

        let mut wait = {
            let client = self.client.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                let result = client.wait_container(&id).await;
                finished_tx.send_replace(true);
                result
            })
        };

        let outcome = tokio::select! {
            biased;

            result = &mut wait => match result {
                Ok(Ok(0)) => Ok(()),
                Ok(Ok(code)) => Err(KilnError::ContainerExit { id: id.to_string(), code }),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(KilnError::Other(format!("wait task failed: {}", e))),
            },
            // An interrupt usually tears the attach stream down with it
            _ = &mut interrupt => {
                wait.abort();
                self.remove_interrupted(id).await;
                Err(KilnError::Interrupted)
            }
            Ok(err) = &mut attach_err_rx => {
                wait.abort();
                Err(err)
            }
        };

        if let Some(resize) = resize {
            resize.abort();
        }

        let completed = !matches!(outcome, Err(KilnError::Interrupted));
        if completed && !attach_stdin {
            // Let the remaining output reach the log
            if tokio::time::timeout(ATTACH_DRAIN_TIMEOUT, &mut attach).await.is_err() {
                tracing::debug!(container = short_id(id), "Attach stream still open after exit");
            }
        }
        attach.abort();

        outcome
    }

    async fn remove_interrupted(&self, id: &str) {
        tracing::warn!("Interrupted by user, removing container {}", short_id(id));
        if let Err(e) = self.client.remove_container(id).await {
            tracing::error!(container = short_id(id), error = %e, "Failed to remove container");
        }
    }
}

/// Keep the container's TTY size in sync with the local terminal.
fn spawn_resize_watcher(client: Arc<dyn EngineClient>, id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        resize_tty(client.as_ref(), &id).await;

        #[cfg(unix)]
        {
            let mut sigwinch =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()).ok();
            loop {
                match sigwinch {
                    Some(ref mut sig) => {
                        if sig.recv().await.is_none() {
                            break;
                        }
                    }
                    None => std::future::pending().await,
                }
                resize_tty(client.as_ref(), &id).await;
            }
        }
    })
}

async fn resize_tty(client: &dyn EngineClient, id: &str) {
    if let Ok((cols, rows)) = crossterm::terminal::size() {
        if let Err(e) = client.resize_container_tty(id, cols, rows).await {
            tracing::debug!(container = short_id(id), error = %e, "Failed to resize tty");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AttachMode, EngineEvent, MemoryEngine};
    use kiln_core::state::State;

    async fn created_container(engine: &MemoryEngine) -> String {
        engine.create_container(&State::default()).await.unwrap()
    }

    fn never() -> InterruptSource {
        Arc::new(|| Box::pin(std::future::pending()))
    }

    fn after(delay: Duration) -> InterruptSource {
        Arc::new(move || Box::pin(tokio::time::sleep(delay)))
    }

    #[tokio::test]
    async fn test_run_success() {
        let engine = Arc::new(MemoryEngine::new());
        let id = created_container(&engine).await;
        let runner = RunCoordinator::new(engine.clone()).with_interrupt(never());

        runner.run_container(&id, false).await.unwrap();
        assert_eq!(engine.count(|e| matches!(e, EngineEvent::Start(_))), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let engine = Arc::new(MemoryEngine::new());
        engine.set_exit_code(2);
        let id = created_container(&engine).await;
        let runner = RunCoordinator::new(engine.clone()).with_interrupt(never());

        let err = runner.run_container(&id, false).await.unwrap_err();
        assert!(matches!(err, KilnError::ContainerExit { code: 2, .. }));
    }

    #[tokio::test]
    async fn test_start_waits_for_attach_ready() {
        let engine = Arc::new(MemoryEngine::new());
        engine.set_attach_mode(AttachMode::SlowReady(Duration::from_millis(30)));
        let id = created_container(&engine).await;
        let runner = RunCoordinator::new(engine.clone()).with_interrupt(never());

        runner.run_container(&id, false).await.unwrap();

        let events = engine.events();
        let ready = events
            .iter()
            .position(|e| matches!(e, EngineEvent::AttachReady { .. }))
            .unwrap();
        let start = events
            .iter()
            .position(|e| matches!(e, EngineEvent::Start(_)))
            .unwrap();
        assert!(ready < start);
    }

    #[tokio::test]
    async fn test_attach_failure_before_start() {
        let engine = Arc::new(MemoryEngine::new());
        engine.set_attach_mode(AttachMode::FailBeforeReady("hijack failed".to_string()));
        let id = created_container(&engine).await;
        let runner = RunCoordinator::new(engine.clone()).with_interrupt(never());

        let err = runner.run_container(&id, false).await.unwrap_err();
        assert!(matches!(err, KilnError::AttachError(ref m) if m == "hijack failed"));
        assert_eq!(engine.count(|e| matches!(e, EngineEvent::Start(_))), 0);
    }

    #[tokio::test]
    async fn test_attach_error_after_exit_is_suppressed() {
        let engine = Arc::new(MemoryEngine::new());
        engine.set_attach_mode(AttachMode::FailAfterExit("use of closed connection".to_string()));
        let id = created_container(&engine).await;
        let runner = RunCoordinator::new(engine.clone()).with_interrupt(never());

        runner.run_container(&id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_hides_broken_attach() {
        let engine = Arc::new(MemoryEngine::new());
        engine.block_wait();
        let (fire, signal) = watch::channel(false);
        engine.set_attach_mode(AttachMode::FailOnSignal(
            signal.clone(),
            "connection reset by peer".to_string(),
        ));
        let id = created_container(&engine).await;

        let interrupt: InterruptSource = Arc::new(move || {
            let mut signal = signal.clone();
            Box::pin(async move {
                let _ = signal.wait_for(|fired| *fired).await;
            })
        });
        let runner = RunCoordinator::new(engine.clone()).with_interrupt(interrupt);

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            fire.send_replace(true);
        });
        let err = runner.run_container(&id, false).await.unwrap_err();
        trigger.await.unwrap();

        assert!(matches!(err, KilnError::Interrupted));
        assert_eq!(
            engine.count(|e| matches!(e, EngineEvent::RemoveContainer(c) if *c == id)),
            1
        );
        assert!(engine.container(&id).is_none());
    }

    #[tokio::test]
    async fn test_interrupt_removes_container() {
        let engine = Arc::new(MemoryEngine::new());
        engine.block_wait();
        engine.set_attach_mode(AttachMode::FailAfterExit("stdin closed".to_string()));
        let id = created_container(&engine).await;
        let runner = RunCoordinator::new(engine.clone())
            .with_interrupt(after(Duration::from_millis(20)));

        let err = runner.run_container(&id, false).await.unwrap_err();
        assert!(matches!(err, KilnError::Interrupted));
        assert_eq!(
            engine.count(|e| matches!(e, EngineEvent::RemoveContainer(c) if *c == id)),
            1
        );
        assert!(engine.container(&id).is_none());
    }
}
