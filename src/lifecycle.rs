//! Node lifecycle state machine.
//!
//! ```text
//! Stopped -> Starting -> Started
//! Started -> Restarting -> Starting
//! Started -> ShuttingDown -> Shutdown
//! Starting | Restarting -> Failed   (terminal)
//! ```
//!
//! The node supervisor owns the [`LifecycleDriver`] and is the only place that
//! performs transitions. Everything else (OS signals, the RPC `restart` and
//! `shutdown` calls, the CLI) goes through [`LifecycleHandle::request`].

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Stopped,
    Starting,
    Started,
    Restarting,
    ShuttingDown,
    Shutdown,
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Stopped => "stopped",
            NodeState::Starting => "starting",
            NodeState::Started => "started",
            NodeState::Restarting => "restarting",
            NodeState::ShuttingDown => "shutting_down",
            NodeState::Shutdown => "shutdown",
            NodeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl NodeState {
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Failed)
                | (Started, Restarting)
                | (Started, ShuttingDown)
                | (Restarting, Starting)
                | (Restarting, Failed)
                | (ShuttingDown, Shutdown)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Shutdown | NodeState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Restart,
    Shutdown,
}

impl LifecycleCommand {
    /// State the supervisor moves to when it acts on this command.
    fn target(self) -> NodeState {
        match self {
            LifecycleCommand::Restart => NodeState::Restarting,
            LifecycleCommand::Shutdown => NodeState::ShuttingDown,
        }
    }

    /// Whether a request made while the node is in `state` will be served.
    ///
    /// A restart needs a running node. A shutdown is queued in any live
    /// state and served once the node reaches `Started`.
    fn accepted_in(self, state: NodeState) -> bool {
        match self {
            LifecycleCommand::Restart => state == NodeState::Started,
            LifecycleCommand::Shutdown => !state.is_terminal() && state != NodeState::ShuttingDown,
        }
    }
}

/// Cloneable view of the lifecycle used to observe state and request changes.
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    state_rx: watch::Receiver<NodeState>,
    command_tx: mpsc::Sender<LifecycleCommand>,
}

/// Supervisor side of the lifecycle.
#[derive(Debug)]
pub struct LifecycleDriver {
    state_tx: watch::Sender<NodeState>,
    command_rx: mpsc::Receiver<LifecycleCommand>,
    shutdown_pending: bool,
}

pub fn lifecycle() -> (LifecycleHandle, LifecycleDriver) {
    let (state_tx, state_rx) = watch::channel(NodeState::Stopped);
    let (command_tx, command_rx) = mpsc::channel(8);
    (
        LifecycleHandle {
            state_rx,
            command_tx,
        },
        LifecycleDriver {
            state_tx,
            command_rx,
            shutdown_pending: false,
        },
    )
}

impl LifecycleHandle {
    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    /// Queue a restart or shutdown for the supervisor.
    ///
    /// Validated against the current state so callers get an immediate answer.
    /// An accepted shutdown is never dropped, even when a restart is queued
    /// ahead of it.
    pub fn request(&self, command: LifecycleCommand) -> Result<NodeState> {
        let current = self.state();
        if !command.accepted_in(current) {
            return Err(NodeError::InvalidTransition {
                from: current,
                to: command.target(),
            });
        }
        self.command_tx.try_send(command).map_err(|e| {
            NodeError::Internal(format!("lifecycle command not accepted: {}", e))
        })?;
        tracing::info!(?command, state = %current, "Lifecycle change requested");
        Ok(current)
    }

    /// Wait until the state satisfies `pred`, returning that state.
    pub async fn wait_for(&self, pred: impl Fn(NodeState) -> bool) -> NodeState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            if pred(state) {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }
}

impl LifecycleDriver {
    pub fn state(&self) -> NodeState {
        *self.state_tx.borrow()
    }

    pub fn transition(&self, next: NodeState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(NodeError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.state_tx.send_replace(next);
        tracing::info!(from = %current, to = %next, "Node state changed");
        Ok(())
    }

    /// Next command to serve; `None` once every handle is gone.
    ///
    /// Commands queued together collapse into one, with shutdown winning
    /// over restart.
    pub async fn next_command(&mut self) -> Option<LifecycleCommand> {
        if std::mem::take(&mut self.shutdown_pending) {
            self.drain_queued();
            return Some(LifecycleCommand::Shutdown);
        }
        let first = self.command_rx.recv().await?;
        self.shutdown_pending = first == LifecycleCommand::Shutdown;
        self.drain_queued();
        if std::mem::take(&mut self.shutdown_pending) {
            Some(LifecycleCommand::Shutdown)
        } else {
            Some(first)
        }
    }

    /// Fold everything queued so far into the pending state.
    ///
    /// Restarts requested while a restart was in progress are duplicates and
    /// are dropped; a shutdown is remembered for the next [`next_command`].
    /// Returns how many restarts were dropped.
    ///
    /// [`next_command`]: LifecycleDriver::next_command
    pub fn drain_queued(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                LifecycleCommand::Shutdown => self.shutdown_pending = true,
                LifecycleCommand::Restart => dropped += 1,
            }
        }
        dropped
    }

    pub fn shutdown_pending(&self) -> bool {
        self.shutdown_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions() {
        use NodeState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Started));
        assert!(Started.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Starting));
        assert!(Started.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Shutdown));
        assert!(Starting.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states_do_not_move() {
        use NodeState::*;
        for next in [Stopped, Starting, Started, Restarting, ShuttingDown, Shutdown, Failed] {
            assert!(!Shutdown.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
        assert!(Shutdown.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Started.is_terminal());
    }

    #[test]
    fn restart_requires_started() {
        let (handle, driver) = lifecycle();
        let err = handle.request(LifecycleCommand::Restart).unwrap_err();
        assert!(matches!(
            err,
            NodeError::InvalidTransition {
                from: NodeState::Stopped,
                to: NodeState::Restarting
            }
        ));

        driver.transition(NodeState::Starting).unwrap();
        driver.transition(NodeState::Started).unwrap();
        assert_eq!(
            handle.request(LifecycleCommand::Restart).unwrap(),
            NodeState::Started
        );
    }

    #[tokio::test]
    async fn driver_receives_requested_commands() {
        let (handle, mut driver) = lifecycle();
        driver.transition(NodeState::Starting).unwrap();
        driver.transition(NodeState::Started).unwrap();

        handle.request(LifecycleCommand::Shutdown).unwrap();
        assert_eq!(driver.next_command().await, Some(LifecycleCommand::Shutdown));
    }

    #[tokio::test]
    async fn wait_for_observes_transitions() {
        let (handle, driver) = lifecycle();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for(|s| s == NodeState::Started).await })
        };
        driver.transition(NodeState::Starting).unwrap();
        driver.transition(NodeState::Started).unwrap();
        assert_eq!(waiter.await.unwrap(), NodeState::Started);
    }

    #[tokio::test]
    async fn shutdown_wins_over_queued_restart() {
        let (handle, mut driver) = lifecycle();
        driver.transition(NodeState::Starting).unwrap();
        driver.transition(NodeState::Started).unwrap();

        handle.request(LifecycleCommand::Restart).unwrap();
        handle.request(LifecycleCommand::Shutdown).unwrap();
        handle.request(LifecycleCommand::Restart).unwrap();
        assert_eq!(driver.next_command().await, Some(LifecycleCommand::Shutdown));
        assert!(!driver.shutdown_pending());
    }

    #[tokio::test]
    async fn shutdown_during_restart_is_kept() {
        let (handle, mut driver) = lifecycle();
        driver.transition(NodeState::Starting).unwrap();
        driver.transition(NodeState::Started).unwrap();

        handle.request(LifecycleCommand::Restart).unwrap();
        assert_eq!(driver.next_command().await, Some(LifecycleCommand::Restart));
        driver.transition(NodeState::Restarting).unwrap();

        // Another restart is rejected, a shutdown is queued behind the restart.
        assert!(handle.request(LifecycleCommand::Restart).is_err());
        handle.request(LifecycleCommand::Shutdown).unwrap();
        assert_eq!(driver.drain_queued(), 0);
        assert!(driver.shutdown_pending());

        driver.transition(NodeState::Starting).unwrap();
        driver.transition(NodeState::Started).unwrap();
        assert_eq!(driver.next_command().await, Some(LifecycleCommand::Shutdown));
    }

    #[test]
    fn shutdown_is_queued_while_starting() {
        let (handle, driver) = lifecycle();
        driver.transition(NodeState::Starting).unwrap();
        assert_eq!(
            handle.request(LifecycleCommand::Shutdown).unwrap(),
            NodeState::Starting
        );
        assert!(!NodeState::Starting.can_transition_to(NodeState::ShuttingDown));
    }

    #[test]
    fn driver_rejects_skipping_states() {
        let (_handle, driver) = lifecycle();
        assert!(driver.transition(NodeState::Started).is_err());
        assert_eq!(driver.state(), NodeState::Stopped);
    }
}
