//! Broadcast shutdown signaling for capture workers.
//!
//! A single [`ShutdownTx`] fans out to every worker task through cloned
//! [`ShutdownRx`] receivers. Workers observe the signal cooperatively: they
//! stop pulling new events, let in-flight dispatch finish, and never write a
//! position for an event that did not complete.

use tokio::sync::watch;

/// Receiver side of the shutdown channel.
///
/// Workers either await [`watch::Receiver::changed`] to suspend until shutdown
/// or poll [`watch::Receiver::has_changed`] at loop boundaries.
pub type ShutdownRx = watch::Receiver<()>;

/// Transmitter side of the shutdown channel.
///
/// Cloning is cheap; every clone signals the same set of receivers.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Signals shutdown to all subscribed receivers.
    ///
    /// Fails only when no receiver is alive anymore, which means every worker
    /// has already terminated.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Creates a new receiver subscribed to this transmitter.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Creates a new shutdown channel.
///
/// The channel carries no data; the value change itself is the signal. All
/// receivers, including ones subscribed after the signal was sent, observe it.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}

/// Outcome of an operation that can be preempted by shutdown.
///
/// The `Shutdown` variant still carries data so that callers can drain work
/// accumulated before the signal was observed.
#[derive(Debug, PartialEq)]
pub enum ShutdownResult<T, S> {
    /// The operation completed normally.
    Ok(T),
    /// Shutdown was observed; the payload is whatever had accumulated.
    Shutdown(S),
}
