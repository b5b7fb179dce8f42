//! Per-device capture control.
//!
//! [`CaptureStateMachine`] is the pure transition function; it turns lock
//! and trigger observations into states and side-effect requests.
//! [`CaptureController`] drives it from the live lock and trigger
//! subscriptions and runs the countdown, capture and upload.

use crate::capture::{CaptureEngine, Countdown, CountdownOutcome, EncodedImage};
use crate::error::BoothError;
use crate::resource_lock::{LockRecord, ResourceLock};
use crate::trigger::{TriggerChannel, TriggerUpdate};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureState {
    /// Another device owns the camera resource.
    Locked,
    Waiting,
    CameraReady,
    Capturing,
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    LockAcquired,
    LockDenied,
    /// A push of the lock record.
    LockObserved(Option<LockRecord>),
    /// A push of the trigger document.
    Trigger(TriggerUpdate),
    /// The completion reset of the last cycle committed at `version`.
    ResetCommitted { version: u64 },
    /// The capture task of `cycle` finished, successfully or not.
    CaptureFinished { cycle: u64 },
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AcquireLock,
    StartCapture { cycle: u64 },
    CancelCapture,
    ResetTrigger,
}

#[derive(Debug)]
pub struct CaptureStateMachine {
    device_id: String,
    state: CaptureState,
    owns_lock: bool,
    cycle: u64,
    /// Trigger version that started the current cycle.
    cycle_version: Option<u64>,
    /// Trigger pushes up to this version predate the last completion reset.
    stale_through: Option<u64>,
}

impl CaptureStateMachine {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: CaptureState::Waiting,
            owns_lock: false,
            cycle: 0,
            cycle_version: None,
            stale_through: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn owns_lock(&self) -> bool {
        self.owns_lock
    }

    pub fn apply(&mut self, event: CaptureEvent) -> Option<Action> {
        let before = self.state;
        let action = self.transition(event);
        if before != self.state {
            debug!(from = ?before, to = ?self.state, "Capture state changed");
        }
        action
    }

    fn transition(&mut self, event: CaptureEvent) -> Option<Action> {
        match event {
            CaptureEvent::LockAcquired => {
                self.owns_lock = true;
                if self.state == CaptureState::Locked {
                    self.state = CaptureState::Waiting;
                }
                None
            }
            CaptureEvent::LockDenied => {
                self.owns_lock = false;
                self.leave_capture(CaptureState::Locked)
            }
            CaptureEvent::LockObserved(record) => {
                let unlocked = record.as_ref().map_or(true, |r| !r.is_locked);
                if self.state == CaptureState::Locked && unlocked {
                    return Some(Action::AcquireLock);
                }
                let lost = record
                    .as_ref()
                    .is_some_and(|r| r.is_locked && r.owner_id != self.device_id);
                if self.owns_lock && lost {
                    warn!(device_id = %self.device_id, "Lock taken over by another device");
                    self.owns_lock = false;
                    return self.leave_capture(CaptureState::Locked);
                }
                None
            }
            CaptureEvent::Trigger(update) => self.on_trigger(update),
            CaptureEvent::ResetCommitted { version } => {
                self.stale_through = self.stale_through.max(Some(version));
                None
            }
            CaptureEvent::CaptureFinished { cycle } => {
                if self.state != CaptureState::Capturing || cycle != self.cycle {
                    return None;
                }
                self.state = CaptureState::Waiting;
                // Even if the reset never commits, the push that started
                // this cycle must not start another one.
                self.stale_through = self.stale_through.max(self.cycle_version);
                Some(Action::ResetTrigger)
            }
        }
    }

    fn on_trigger(&mut self, update: TriggerUpdate) -> Option<Action> {
        // A device that does not own the camera never reacts to the trigger.
        if !self.owns_lock {
            return None;
        }

        // Anything the operator writes after the reset has a higher version.
        if update.version.is_some() && update.version <= self.stale_through {
            return None;
        }

        let trigger = update.record;
        if trigger.take_photo {
            if self.state == CaptureState::Capturing {
                return None;
            }
            self.cycle += 1;
            self.cycle_version = update.version;
            self.state = CaptureState::Capturing;
            Some(Action::StartCapture { cycle: self.cycle })
        } else if trigger.show_camera {
            self.leave_capture(CaptureState::CameraReady)
        } else {
            self.leave_capture(CaptureState::Waiting)
        }
    }

    fn leave_capture(&mut self, next: CaptureState) -> Option<Action> {
        let was_capturing = self.state == CaptureState::Capturing;
        self.state = next;
        was_capturing.then_some(Action::CancelCapture)
    }
}

/// Receives finished captures (the upload collaborator).
#[async_trait]
pub trait CaptureSink: Send + Sync {
    /// Store the image and return where it went.
    async fn deliver(&self, image: EncodedImage) -> Result<String, BoothError>;
}

/// Releases the lock from a detached task when a running controller future
/// is dropped instead of returning.
struct ReleaseOnDrop {
    lock: Option<Arc<ResourceLock>>,
    device_id: String,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else { return };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(device_id = %self.device_id, "No runtime to release lock on drop");
            return;
        };
        let device_id = std::mem::take(&mut self.device_id);
        handle.spawn(async move {
            if let Err(e) = lock.release(&device_id).await {
                warn!(device_id = %device_id, error = %e, "Failed to release lock after drop");
            }
        });
    }
}

/// Snapshot for display surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub state: CaptureState,
    pub countdown: Option<u32>,
}

/// Drives one device's state machine for the lifetime of a session.
pub struct CaptureController {
    device_id: String,
    lock: Arc<ResourceLock>,
    trigger: TriggerChannel,
    engine: Arc<CaptureEngine>,
    sink: Arc<dyn CaptureSink>,
    countdown: Countdown,
    countdown_secs: u32,
    status: Arc<watch::Sender<ControllerStatus>>,
}

impl CaptureController {
    pub fn new(
        device_id: impl Into<String>,
        lock: Arc<ResourceLock>,
        trigger: TriggerChannel,
        engine: Arc<CaptureEngine>,
        sink: Arc<dyn CaptureSink>,
        countdown_secs: u32,
    ) -> Self {
        let (status, _rx) = watch::channel(ControllerStatus {
            state: CaptureState::Waiting,
            countdown: None,
        });

        Self {
            device_id: device_id.into(),
            lock,
            trigger,
            engine,
            sink,
            countdown: Countdown::new(),
            countdown_secs,
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> watch::Receiver<ControllerStatus> {
        self.status.subscribe()
    }

    /// Run until `shutdown` fires.
    ///
    /// A camera that cannot be opened is reported and returned as a
    /// `Device` error before the lock is touched, so the caller can simply
    /// run again later. On every exit the lock is released.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BoothError> {
        if let Err(e) = self.engine.open().await {
            error!(device_id = %self.device_id, error = %e, "Camera unavailable");
            return Err(e);
        }

        let mut guard = ReleaseOnDrop {
            lock: Some(self.lock.clone()),
            device_id: self.device_id.clone(),
        };
        let result = self.control_loop(&shutdown).await;

        self.engine.close().await;
        if let Err(e) = self.lock.release(&self.device_id).await {
            warn!(device_id = %self.device_id, error = %e, "Failed to release lock on exit");
        }
        // Disarmed only now: a drop during the release above must still release.
        guard.lock = None;
        info!(device_id = %self.device_id, "Capture controller stopped");

        result
    }

    async fn control_loop(&self, shutdown: &CancellationToken) -> Result<(), BoothError> {
        let mut machine = CaptureStateMachine::new(self.device_id.clone());
        let mut lock_sub = self.lock.subscribe().await?;
        let mut trigger_sub = self.trigger.subscribe().await?;
        let (done_tx, mut done_rx) = mpsc::channel::<u64>(4);
        let mut capture_cancel: Option<CancellationToken> = None;
        let mut capture_task: Option<JoinHandle<()>> = None;

        // Without a staleness timeout a denied device only retries on pushes
        // and an owner has nothing to renew.
        let stale_after = self.lock.stale_after();
        let idle = Duration::from_secs(3600);
        let mut stale_retry = tokio::time::interval(stale_after.unwrap_or(idle));
        stale_retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stale_retry.tick().await;
        let renew_period = stale_after.map_or(idle, |limit| (limit / 3).max(Duration::from_millis(10)));
        let mut renew = tokio::time::interval(renew_period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        let mut pending = Some(Action::AcquireLock);

        let outcome = 'control: loop {
            while let Some(action) = pending.take() {
                pending = match action {
                    Action::AcquireLock => {
                        let event = match self.lock.try_acquire(&self.device_id).await {
                            Ok(result) if result.granted => CaptureEvent::LockAcquired,
                            Ok(_) => CaptureEvent::LockDenied,
                            Err(e @ BoothError::TransactionConflict { .. }) => {
                                warn!(error = %e, "Could not acquire lock");
                                CaptureEvent::LockDenied
                            }
                            Err(e) => break 'control Err(e),
                        };
                        let mut next = machine.apply(event);
                        if machine.owns_lock() && next.is_none() {
                            next = machine.apply(CaptureEvent::Trigger(trigger_sub.current()));
                        }
                        next
                    }
                    Action::StartCapture { cycle } => {
                        let token = shutdown.child_token();
                        capture_cancel = Some(token.clone());
                        let previous = capture_task.take();
                        capture_task = Some(self.spawn_capture(cycle, token, previous, done_tx.clone()));
                        None
                    }
                    Action::CancelCapture => {
                        if let Some(token) = capture_cancel.take() {
                            token.cancel();
                        }
                        None
                    }
                    Action::ResetTrigger => match self.trigger.complete().await {
                        Ok(version) => machine.apply(CaptureEvent::ResetCommitted { version }),
                        Err(e) => {
                            error!(error = %e, "Failed to reset trigger after capture");
                            None
                        }
                    },
                };
            }
            // Only after side effects settled.
            self.publish_state(machine.state());

            let retry_locked = machine.state() == CaptureState::Locked && stale_after.is_some();
            let renewing = machine.owns_lock() && stale_after.is_some();
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'control Ok(()),
                Some(cycle) = done_rx.recv() => CaptureEvent::CaptureFinished { cycle },
                changed = lock_sub.changed() => match changed {
                    Some(record) => CaptureEvent::LockObserved(record),
                    None => break 'control Err(BoothError::Infrastructure("lock subscription closed".to_string())),
                },
                changed = trigger_sub.changed() => match changed {
                    Some(update) => CaptureEvent::Trigger(update),
                    None => break 'control Err(BoothError::Infrastructure("trigger subscription closed".to_string())),
                },
                _ = stale_retry.tick(), if retry_locked => {
                    pending = Some(Action::AcquireLock);
                    continue 'control;
                }
                _ = renew.tick(), if renewing => match self.lock.renew(&self.device_id).await {
                    Ok(true) => continue 'control,
                    Ok(false) => CaptureEvent::LockDenied,
                    Err(e) => {
                        warn!(device_id = %self.device_id, error = %e, "Failed to renew lock");
                        continue 'control;
                    }
                },
            };

            pending = machine.apply(event);
        };

        if let Some(token) = capture_cancel.take() {
            token.cancel();
        }
        outcome
    }

    fn publish_state(&self, state: CaptureState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            if state != CaptureState::Capturing {
                status.countdown = None;
            }
            true
        });
    }

    /// Countdown, capture and upload for one cycle.
    ///
    /// The upload is allowed to finish after the controller moved on; its
    /// completion report is simply dropped if nobody listens anymore.
    /// `previous` is the task of the prior cycle, which may still be winding
    /// down after a cancel; the new countdown starts once it is gone.
    fn spawn_capture(
        &self,
        cycle: u64,
        cancel: CancellationToken,
        previous: Option<JoinHandle<()>>,
        done: mpsc::Sender<u64>,
    ) -> JoinHandle<()> {
        let countdown = self.countdown.clone();
        let seconds = self.countdown_secs;
        let engine = self.engine.clone();
        let sink = self.sink.clone();
        let status = self.status.clone();
        let device_id = self.device_id.clone();

        tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(device_id = %device_id, error = %e, "Previous capture task failed");
                }
            }

            let outcome = countdown
                .run(seconds, &cancel, |remaining| {
                    status.send_modify(|s| s.countdown = Some(remaining));
                })
                .await;
            status.send_modify(|s| s.countdown = None);

            match outcome {
                CountdownOutcome::Expired => {}
                CountdownOutcome::Cancelled => {
                    info!(device_id = %device_id, cycle = cycle, "Capture cancelled");
                    return;
                }
                CountdownOutcome::AlreadyRunning => {
                    warn!(device_id = %device_id, cycle = cycle, "Countdown already running, cycle skipped");
                    let _ = done.send(cycle).await;
                    return;
                }
            }

            match engine.capture_frame().await {
                Ok(Some(image)) => match sink.deliver(image).await {
                    Ok(location) => {
                        info!(device_id = %device_id, cycle = cycle, location = %location, "Capture uploaded")
                    }
                    Err(e) => error!(device_id = %device_id, error = %e, "Capture upload failed"),
                },
                Ok(None) => warn!(device_id = %device_id, cycle = cycle, "Capture skipped, another one in flight"),
                Err(e) => error!(device_id = %device_id, error = %e, "Capture failed"),
            }

            let _ = done.send(cycle).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::StaticSource;
    use crate::document_store::{
        encode, BatchOp, CasOutcome, DocPath, Document, DocumentStore, Fields, InMemoryDocumentStore, RetryPolicy,
        StoreError,
    };
    use crate::trigger::{TriggerRecord, TRIGGER_ID};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn trigger(version: u64, show_camera: bool, take_photo: bool) -> CaptureEvent {
        CaptureEvent::Trigger(TriggerUpdate {
            record: TriggerRecord {
                show_camera,
                take_photo,
                theme: None,
            },
            version: Some(version),
        })
    }

    fn owned_machine() -> CaptureStateMachine {
        let mut machine = CaptureStateMachine::new("tablet-a");
        machine.apply(CaptureEvent::LockAcquired);
        machine
    }

    #[test]
    fn test_trigger_transitions() {
        let mut machine = owned_machine();
        assert_eq!(machine.state(), CaptureState::Waiting);

        assert_eq!(machine.apply(trigger(1, true, false)), None);
        assert_eq!(machine.state(), CaptureState::CameraReady);

        assert_eq!(machine.apply(trigger(2, true, true)), Some(Action::StartCapture { cycle: 1 }));
        assert_eq!(machine.state(), CaptureState::Capturing);

        assert_eq!(machine.apply(trigger(3, false, false)), Some(Action::CancelCapture));
        assert_eq!(machine.state(), CaptureState::Waiting);
    }

    #[test]
    fn test_locked_device_ignores_take_photo() {
        let mut machine = CaptureStateMachine::new("tablet-b");
        machine.apply(CaptureEvent::LockDenied);
        assert_eq!(machine.state(), CaptureState::Locked);

        assert_eq!(machine.apply(trigger(1, false, true)), None);
        assert_eq!(machine.state(), CaptureState::Locked);
    }

    #[test]
    fn test_unlock_push_triggers_reacquire() {
        let mut machine = CaptureStateMachine::new("tablet-b");
        machine.apply(CaptureEvent::LockDenied);

        let held = LockRecord {
            is_locked: true,
            owner_id: "tablet-a".to_string(),
            locked_at: None,
        };
        assert_eq!(machine.apply(CaptureEvent::LockObserved(Some(held))), None);

        let free = LockRecord::default();
        assert_eq!(
            machine.apply(CaptureEvent::LockObserved(Some(free))),
            Some(Action::AcquireLock)
        );

        machine.apply(CaptureEvent::LockAcquired);
        assert_eq!(machine.state(), CaptureState::Waiting);
    }

    #[test]
    fn test_repeated_take_photo_starts_one_cycle() {
        let mut machine = owned_machine();
        assert!(machine.apply(trigger(1, true, true)).is_some());
        assert_eq!(machine.apply(trigger(2, true, true)), None);
    }

    #[test]
    fn test_completion_resets_exactly_once() {
        let mut machine = owned_machine();
        machine.apply(trigger(1, true, true));

        assert_eq!(
            machine.apply(CaptureEvent::CaptureFinished { cycle: 1 }),
            Some(Action::ResetTrigger)
        );
        assert_eq!(machine.state(), CaptureState::Waiting);

        // Duplicate completion and a late copy of the push that started it.
        assert_eq!(machine.apply(CaptureEvent::CaptureFinished { cycle: 1 }), None);
        assert_eq!(machine.apply(trigger(1, true, true)), None);
        assert_eq!(machine.state(), CaptureState::Waiting);

        // The reset lands, then the operator starts a new cycle.
        assert_eq!(machine.apply(CaptureEvent::ResetCommitted { version: 2 }), None);
        assert_eq!(machine.apply(trigger(2, false, false)), None);
        assert_eq!(machine.apply(trigger(3, true, true)), Some(Action::StartCapture { cycle: 2 }));
    }

    #[test]
    fn test_take_written_right_after_reset_starts_new_cycle() {
        let mut machine = owned_machine();
        machine.apply(trigger(1, true, true));
        machine.apply(CaptureEvent::CaptureFinished { cycle: 1 });
        machine.apply(CaptureEvent::ResetCommitted { version: 2 });

        // The reset push (version 2) is never observed; the channel already
        // holds the operator's next take.
        assert_eq!(machine.apply(trigger(3, true, true)), Some(Action::StartCapture { cycle: 2 }));
        assert_eq!(machine.state(), CaptureState::Capturing);
    }

    #[test]
    fn test_failed_reset_does_not_repeat_cycle() {
        let mut machine = owned_machine();
        machine.apply(trigger(4, true, true));
        machine.apply(CaptureEvent::CaptureFinished { cycle: 1 });

        // No ResetCommitted: the document still reads takePhoto at version 4.
        machine.apply(CaptureEvent::LockAcquired);
        assert_eq!(machine.apply(trigger(4, true, true)), None);
        assert_eq!(machine.apply(trigger(5, true, true)), Some(Action::StartCapture { cycle: 2 }));
    }

    #[test]
    fn test_finish_of_cancelled_cycle_is_ignored() {
        let mut machine = owned_machine();
        machine.apply(trigger(1, true, true));
        machine.apply(trigger(2, false, false));
        machine.apply(trigger(3, true, true));

        assert_eq!(machine.apply(CaptureEvent::CaptureFinished { cycle: 1 }), None);
        assert_eq!(machine.state(), CaptureState::Capturing);
    }

    #[test]
    fn test_losing_lock_cancels_capture() {
        let mut machine = owned_machine();
        machine.apply(trigger(1, true, true));

        let stolen = LockRecord {
            is_locked: true,
            owner_id: "tablet-b".to_string(),
            locked_at: None,
        };
        assert_eq!(
            machine.apply(CaptureEvent::LockObserved(Some(stolen))),
            Some(Action::CancelCapture)
        );
        assert_eq!(machine.state(), CaptureState::Locked);
        assert_eq!(machine.apply(trigger(2, true, true)), None);
    }

    struct RecordingSink {
        images: Mutex<Vec<EncodedImage>>,
        delivered: watch::Sender<usize>,
    }

    impl Default for RecordingSink {
        fn default() -> Self {
            Self {
                images: Mutex::default(),
                delivered: watch::channel(0).0,
            }
        }
    }

    impl RecordingSink {
        async fn wait_for_deliveries(&self, count: usize) {
            let mut rx = self.delivered.subscribe();
            rx.wait_for(|n| *n >= count).await.expect("sink dropped");
        }
    }

    #[async_trait]
    impl CaptureSink for RecordingSink {
        async fn deliver(&self, image: EncodedImage) -> Result<String, BoothError> {
            let mut images = self.images.lock();
            images.push(image);
            self.delivered.send_replace(images.len());
            Ok(format!("memory/{}", images.len()))
        }
    }

    /// In-memory store with hooks for interleavings that are hard to hit
    /// by timing alone.
    #[derive(Default)]
    struct ScriptedStore {
        inner: InMemoryDocumentStore,
        /// Write a new take right after the next merge into the trigger.
        take_after_reset: AtomicBool,
        /// Park the next read of the lock document for a while.
        stall_lock_read: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for ScriptedStore {
        async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
            if path.id() == "resource" && self.stall_lock_read.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.inner.get(path).await
        }

        async fn set(&self, path: &DocPath, fields: Fields) -> Result<Document, StoreError> {
            self.inner.set(path, fields).await
        }

        async fn update(&self, path: &DocPath, fields: Fields) -> Result<Document, StoreError> {
            let doc = self.inner.update(path, fields).await?;
            if path.id() == TRIGGER_ID && self.take_after_reset.swap(false, Ordering::SeqCst) {
                let take = TriggerRecord {
                    show_camera: true,
                    take_photo: true,
                    theme: None,
                };
                self.inner.set(path, encode(path, &take)?).await?;
            }
            Ok(doc)
        }

        async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
            self.inner.delete(path).await
        }

        async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
            self.inner.list(collection).await
        }

        async fn compare_and_swap(
            &self,
            path: &DocPath,
            expected_version: Option<u64>,
            fields: Fields,
        ) -> Result<CasOutcome, StoreError> {
            self.inner.compare_and_swap(path, expected_version, fields).await
        }

        async fn commit_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
            self.inner.commit_batch(ops).await
        }

        async fn watch(&self, path: &DocPath) -> Result<watch::Receiver<Option<Document>>, StoreError> {
            self.inner.watch(path).await
        }
    }

    struct Device {
        controller: Arc<CaptureController>,
        sink: Arc<RecordingSink>,
    }

    fn device(store: Arc<dyn DocumentStore>, id: &str) -> Device {
        device_with_stale_after(store, id, None)
    }

    fn device_with_stale_after(store: Arc<dyn DocumentStore>, id: &str, stale_after: Option<Duration>) -> Device {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let lock = Arc::new(ResourceLock::new(store.clone(), "resource", retry).with_stale_after(stale_after));
        let trigger = TriggerChannel::new(store);
        let engine = Arc::new(CaptureEngine::new(Box::new(StaticSource::new(40, 30)), 0.75, false));
        let sink = Arc::new(RecordingSink::default());
        let controller = Arc::new(CaptureController::new(id, lock, trigger, engine, sink.clone(), 3));
        Device { controller, sink }
    }

    fn start(device: &Device, shutdown: &CancellationToken) -> JoinHandle<Result<(), BoothError>> {
        let controller = device.controller.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { controller.run(token).await })
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ControllerStatus>, state: CaptureState) {
        rx.wait_for(|s| s.state == state)
            .await
            .expect("status channel closed");
    }

    fn take() -> TriggerRecord {
        TriggerRecord {
            show_camera: true,
            take_photo: true,
            theme: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_lock_owner_captures() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let trigger = TriggerChannel::new(store.clone());
        let a = device(store.clone(), "tablet-a");
        let b = device(store.clone(), "tablet-b");

        let shutdown_a = CancellationToken::new();
        let mut status_a = a.controller.status();
        let run_a = start(&a, &shutdown_a);
        // Let tablet-a win the lock before tablet-b starts.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let shutdown_b = CancellationToken::new();
        let mut status_b = b.controller.status();
        let run_b = start(&b, &shutdown_b);
        wait_for_state(&mut status_b, CaptureState::Locked).await;

        trigger
            .publish(TriggerRecord {
                show_camera: true,
                take_photo: true,
                theme: Some("smile".to_string()),
            })
            .await
            .unwrap();

        wait_for_state(&mut status_a, CaptureState::Capturing).await;
        wait_for_state(&mut status_a, CaptureState::Waiting).await;

        assert_eq!(a.sink.images.lock().len(), 1);
        assert!(b.sink.images.lock().is_empty());

        let after = trigger.current().await.unwrap();
        assert!(!after.take_photo);
        assert!(!after.show_camera);

        // tablet-a leaving frees the camera for tablet-b.
        shutdown_a.cancel();
        run_a.await.unwrap().unwrap();
        wait_for_state(&mut status_b, CaptureState::Waiting).await;

        let path = DocPath::new("camera", "resource");
        let lock_doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(lock_doc.fields["ownerId"], serde_json::json!("tablet-b"));

        shutdown_b.cancel();
        run_b.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_right_after_reset_is_captured() {
        let store = Arc::new(ScriptedStore::default());
        let trigger = TriggerChannel::new(store.clone());
        let a = device(store.clone(), "tablet-a");
        let mut status = a.controller.status();

        let shutdown = CancellationToken::new();
        let run = start(&a, &shutdown);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The operator fires again the moment the first reset commits.
        store.take_after_reset.store(true, Ordering::SeqCst);
        trigger.publish(take()).await.unwrap();

        a.sink.wait_for_deliveries(2).await;
        wait_for_state(&mut status, CaptureState::Waiting).await;
        assert_eq!(a.sink.images.lock().len(), 2);

        let after = trigger.current().await.unwrap();
        assert!(!after.take_photo);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retake_after_cancel_still_captures() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let trigger = TriggerChannel::new(store.clone());
        let a = device(store.clone(), "tablet-a");
        let mut status = a.controller.status();

        let shutdown = CancellationToken::new();
        let run = start(&a, &shutdown);
        tokio::time::sleep(Duration::from_millis(10)).await;

        trigger.publish(take()).await.unwrap();
        wait_for_state(&mut status, CaptureState::Capturing).await;

        trigger
            .publish(TriggerRecord {
                show_camera: true,
                take_photo: false,
                theme: None,
            })
            .await
            .unwrap();
        wait_for_state(&mut status, CaptureState::CameraReady).await;

        // Starts while the cancelled countdown may still be unwinding.
        trigger.publish(take()).await.unwrap();
        wait_for_state(&mut status, CaptureState::Capturing).await;

        a.sink.wait_for_deliveries(1).await;
        wait_for_state(&mut status, CaptureState::Waiting).await;
        assert_eq!(a.sink.images.lock().len(), 1);
        assert!(!trigger.current().await.unwrap().take_photo);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_live_owner_keeps_lock_past_stale_timeout() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let stale_after = Some(Duration::from_millis(300));
        let a = device_with_stale_after(store.clone(), "tablet-a", stale_after);
        let b = device_with_stale_after(store.clone(), "tablet-b", stale_after);

        let shutdown = CancellationToken::new();
        let status_a = a.controller.status();
        let run_a = start(&a, &shutdown);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut status_b = b.controller.status();
        let run_b = start(&b, &shutdown);
        wait_for_state(&mut status_b, CaptureState::Locked).await;

        // Several stale periods with tablet-b retrying on each of them.
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(status_a.borrow().state, CaptureState::Waiting);
        assert_eq!(status_b.borrow().state, CaptureState::Locked);
        let lock = ResourceLock::new(store.clone(), "resource", RetryPolicy::default());
        assert!(lock.current().await.unwrap().unwrap().is_held_by("tablet-a"));

        shutdown.cancel();
        run_a.await.unwrap().unwrap();
        run_b.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_controller_releases_lock() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = device(store.clone(), "tablet-a");
        let status = a.controller.status();

        let run = start(&a, &CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(status.borrow().state, CaptureState::Waiting);

        let lock = ResourceLock::new(store.clone(), "resource", RetryPolicy::default());
        assert!(lock.current().await.unwrap().unwrap().is_held_by("tablet-a"));

        run.abort();
        let _ = run.await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!lock.current().await.unwrap().unwrap().is_locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_exit_release_still_releases() {
        let store = Arc::new(ScriptedStore::default());
        let a = device(store.clone(), "tablet-a");

        let shutdown = CancellationToken::new();
        let run = start(&a, &shutdown);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lock = ResourceLock::new(store.clone(), "resource", RetryPolicy::default());
        assert!(lock.current().await.unwrap().unwrap().is_held_by("tablet-a"));

        // The exit release parks on its read; drop the controller there.
        store.stall_lock_read.store(true, Ordering::SeqCst);
        shutdown.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!run.is_finished());

        run.abort();
        let _ = run.await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!lock.current().await.unwrap().unwrap().is_locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_does_not_take_lock() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let retry = RetryPolicy::default();
        let lock = Arc::new(ResourceLock::new(store.clone(), "resource", retry));
        let mut source = StaticSource::new(4, 4);
        source.fail_open = true;
        let engine = Arc::new(CaptureEngine::new(Box::new(source), 1.0, false));
        let controller = CaptureController::new(
            "tablet-a",
            lock.clone(),
            TriggerChannel::new(store),
            engine,
            Arc::new(RecordingSink::default()),
            3,
        );

        let result = controller.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(BoothError::Device(_))));
        assert!(lock.current().await.unwrap().is_none());
    }
}
