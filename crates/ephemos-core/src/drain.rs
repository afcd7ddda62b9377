use tokio::sync::{mpsc, watch};

/// New constructs a new pair for draining.
/// * DrainTrigger can be used to start a draining sequence and wait for it to complete.
/// * DrainWatcher should be held by anything that wants to participate in the draining. This can be
///   cloned, and a drain will not complete until all outstanding DrainWatchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(None);
	let (drained_tx, drained_rx) = mpsc::channel(1);

	let trigger = DrainTrigger {
		drained_rx,
		signal_tx,
	};
	let watcher = DrainWatcher {
		drained_tx,
		signal_rx,
	};
	(trigger, watcher)
}

enum Never {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrainMode {
	Immediate,
	Graceful,
}

/// Send a drain command to all watchers.
pub struct DrainTrigger {
	drained_rx: mpsc::Receiver<Never>,
	signal_tx: watch::Sender<Option<DrainMode>>,
}

impl DrainTrigger {
	/// The number of live watchers.
	pub fn count(&self) -> usize {
		self.signal_tx.receiver_count()
	}

	/// Asynchronously signals all watchers to begin draining and waits for all
	/// handles to be dropped.
	pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
		let _ = self.signal_tx.send(Some(mode));

		// Wait for all watchers to release their drain handle.
		match self.drained_rx.recv().await {
			None => {},
			Some(n) => match n {},
		}
	}
}

/// Watch for a drain command.
///
/// All `DrainWatcher` instances must be dropped for a `start_drain_and_wait` call to complete.
#[derive(Clone)]
pub struct DrainWatcher {
	drained_tx: mpsc::Sender<Never>,
	signal_rx: watch::Receiver<Option<DrainMode>>,
}

#[must_use = "DrainBlocker should be dropped explicitly to release the drain"]
#[derive(Clone)]
#[allow(dead_code)]
pub struct DrainBlocker(mpsc::Sender<Never>, DrainMode);

impl DrainBlocker {
	pub fn mode(&self) -> DrainMode {
		self.1
	}
}

impl DrainWatcher {
	/// Returns a `DrainBlocker` after the drain has been signaled. The
	/// handle must be dropped when the shutdown action has been completed to
	/// unblock the drain.
	pub async fn wait_for_drain(mut self) -> DrainBlocker {
		let mode = self
			.signal_rx
			.wait_for(Option::is_some)
			.await
			.map(|mode| mode.expect("already asserted it is_some"))
			// If the trigger was dropped entirely, a graceful shutdown is not required.
			.unwrap_or(DrainMode::Immediate);

		DrainBlocker(self.drained_tx, mode)
	}
}

impl std::fmt::Debug for DrainTrigger {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DrainTrigger").finish_non_exhaustive()
	}
}

impl std::fmt::Debug for DrainWatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DrainWatcher").finish_non_exhaustive()
	}
}
