//! Per-device writer task and its handle.
//!
//! # Why a single writer? (for beginners)
//!
//! A vest has one interrupt OUT endpoint.  If two sessions wrote to it at the
//! same time, their packets could interleave or be reordered by the USB
//! stack.  Instead, every write job is pushed into one bounded FIFO queue and
//! a dedicated task drains it:
//!
//! ```text
//!  session A ──┐                     ┌──────────────┐
//!  session B ──┼── try_send(job) ──► │ mpsc (FIFO)  │ ──► writer task ──► USB
//!  playback  ──┘                     └──────────────┘          │
//!                                                              └─ DeviceLost on failure
//! ```
//!
//! Jobs run strictly in the order they were enqueued.  A job may carry a
//! oneshot channel that reports its outcome once every frame is written.
//!
//! On the first definitive write failure the writer reports the failure to
//! the job that hit it, publishes a [`DeviceLost`] notification, cancels the
//! jobs still queued, closes the transport, and exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use vest_core::{CellCommand, PACKET_LEN};

use super::{TransportError, VestTransport};
use crate::domain::DeviceId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Tuning for the writer task.
#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    /// Maximum number of queued jobs before `submit` fails with `QueueFull`.
    pub queue_depth: usize,
    /// Upper bound on one packet write.
    pub write_timeout: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            write_timeout: Duration::from_millis(500),
        }
    }
}

/// Outcome of a job that was accepted but did not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("{0}")]
    Transport(String),
    #[error("device closed before the write ran")]
    Cancelled,
}

/// Why a job could not be enqueued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("device write queue is full")]
    QueueFull,
    #[error("device is not connected")]
    Closed,
}

/// Sent by a writer task when its device stopped accepting writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLost {
    pub device_id: DeviceId,
    /// Identifies which connection failed, so a stale report about an old
    /// connection can be told apart from the current one.
    pub connection_id: u64,
    pub reason: String,
}

/// Receiver half of a job's completion report.
pub type Completion = oneshot::Receiver<Result<(), WriteError>>;

struct WriteJob {
    frames: Vec<CellCommand>,
    done: oneshot::Sender<Result<(), WriteError>>,
}

/// Owning handle to one device's writer task.
///
/// Dropping the handle cancels the writer: queued jobs are answered with
/// [`WriteError::Cancelled`] and the transport is closed.
#[derive(Debug)]
pub struct DeviceHandle {
    connection_id: u64,
    jobs: mpsc::Sender<WriteJob>,
    cancel: watch::Sender<bool>,
}

impl DeviceHandle {
    /// Spawns the writer task for an open transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        device_id: DeviceId,
        transport: Box<dyn VestTransport>,
        settings: WriterSettings,
        lost_tx: mpsc::UnboundedSender<DeviceLost>,
    ) -> Self {
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (jobs_tx, jobs_rx) = mpsc::channel(settings.queue_depth.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let writer = Writer {
            device_id,
            connection_id,
            transport,
            write_timeout: settings.write_timeout,
            lost_tx,
        };
        tokio::spawn(writer.run(jobs_rx, cancel_rx));

        Self {
            connection_id,
            jobs: jobs_tx,
            cancel: cancel_tx,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Enqueues one job without waiting.
    ///
    /// Returns a receiver that resolves once every frame has been written or
    /// the job failed.  Dropping the receiver does not cancel the job.
    ///
    /// # Errors
    ///
    /// [`SubmitError::QueueFull`] if the queue is at capacity, or
    /// [`SubmitError::Closed`] if the writer has exited.
    pub fn submit(&self, frames: Vec<CellCommand>) -> Result<Completion, SubmitError> {
        submit(&self.jobs, frames)
    }

    /// A cloneable submitter that does not keep the writer alive.
    pub fn sender(&self) -> JobSender {
        JobSender {
            jobs: self.jobs.clone(),
        }
    }

    /// Cancels the writer.  Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

/// Enqueues jobs on a writer owned elsewhere.
///
/// Once the owning [`DeviceHandle`] is dropped, submissions fail with
/// [`SubmitError::Closed`].
#[derive(Debug, Clone)]
pub struct JobSender {
    jobs: mpsc::Sender<WriteJob>,
}

impl JobSender {
    /// See [`DeviceHandle::submit`].
    pub fn submit(&self, frames: Vec<CellCommand>) -> Result<Completion, SubmitError> {
        submit(&self.jobs, frames)
    }
}

fn submit(jobs: &mpsc::Sender<WriteJob>, frames: Vec<CellCommand>) -> Result<Completion, SubmitError> {
    let (done, rx) = oneshot::channel();
    jobs.try_send(WriteJob { frames, done }).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
        mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
    })?;
    Ok(rx)
}

// ── Writer task ───────────────────────────────────────────────────────────────

struct Writer {
    device_id: DeviceId,
    connection_id: u64,
    transport: Box<dyn VestTransport>,
    write_timeout: Duration,
    lost_tx: mpsc::UnboundedSender<DeviceLost>,
}

impl Writer {
    async fn run(mut self, mut jobs: mpsc::Receiver<WriteJob>, mut cancel: watch::Receiver<bool>) {
        debug!("writer {}: started", self.device_id);

        loop {
            let job = tokio::select! {
                biased;
                // Err means the handle was dropped; both cases stop the writer.
                _ = cancel.changed() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            match self.write_frames(&job.frames).await {
                Ok(()) => {
                    let _ = job.done.send(Ok(()));
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!("writer {}: write failed: {reason}", self.device_id);
                    let _ = job.done.send(Err(WriteError::Transport(reason.clone())));
                    let _ = self.lost_tx.send(DeviceLost {
                        device_id: self.device_id.clone(),
                        connection_id: self.connection_id,
                        reason,
                    });
                    break;
                }
            }
        }

        jobs.close();
        let mut cancelled = 0usize;
        while let Ok(job) = jobs.try_recv() {
            let _ = job.done.send(Err(WriteError::Cancelled));
            cancelled += 1;
        }
        self.transport.close();
        debug!(
            "writer {}: stopped ({cancelled} queued job(s) cancelled)",
            self.device_id
        );
    }

    async fn write_frames(&mut self, frames: &[CellCommand]) -> Result<(), TransportError> {
        for frame in frames {
            self.write_packet(frame.encode()).await?;
        }
        Ok(())
    }

    /// Writes one packet, retrying once after a short write.
    async fn write_packet(&mut self, packet: [u8; PACKET_LEN]) -> Result<(), TransportError> {
        let mut retried = false;
        loop {
            let written =
                match tokio::time::timeout(self.write_timeout, self.transport.write_packet(packet))
                    .await
                {
                    Err(_) => return Err(TransportError::Timeout),
                    Ok(result) => result?,
                };

            if written == PACKET_LEN {
                return Ok(());
            }
            if retried {
                return Err(TransportError::ShortWrite {
                    written,
                    expected: PACKET_LEN,
                });
            }
            debug!(
                "writer {}: short write ({written} of {PACKET_LEN} bytes), retrying",
                self.device_id
            );
            retried = true;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use vest_core::decode;

    use super::*;
    use crate::infrastructure::device::MockVestTransport;

    fn frames(cells: &[(u8, u8)]) -> Vec<CellCommand> {
        cells
            .iter()
            .map(|&(c, s)| CellCommand::new(c, s).unwrap())
            .collect()
    }

    fn recording_transport(log: Arc<Mutex<Vec<(u8, u8)>>>) -> MockVestTransport {
        let mut mock = MockVestTransport::new();
        mock.expect_write_packet().returning(move |packet| {
            let d = decode(&packet).unwrap();
            log.lock().unwrap().push((d.cell, d.speed));
            Ok(packet.len())
        });
        mock.expect_close().return_const(());
        mock
    }

    #[tokio::test]
    async fn test_jobs_are_written_in_submission_order() {
        // Arrange
        let log = Arc::new(Mutex::new(Vec::new()));
        let (lost_tx, _lost_rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::spawn(
            DeviceId::new("mock_1"),
            Box::new(recording_transport(log.clone())),
            WriterSettings::default(),
            lost_tx,
        );

        // Act
        let first = handle.submit(frames(&[(0, 1), (1, 2)])).unwrap();
        let second = handle.submit(frames(&[(2, 3)])).unwrap();
        let third = handle.submit(frames(&[(3, 4)])).unwrap();

        // Assert
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
        assert_eq!(third.await.unwrap(), Ok(()));
        assert_eq!(*log.lock().unwrap(), vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
    }

    #[tokio::test]
    async fn test_write_failure_reports_loss_and_cancels_queue() {
        // Arrange
        let mut mock = MockVestTransport::new();
        mock.expect_write_packet()
            .returning(|_| Err(TransportError::Disconnected));
        mock.expect_close().times(1).return_const(());
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::spawn(
            DeviceId::new("mock_1"),
            Box::new(mock),
            WriterSettings::default(),
            lost_tx,
        );
        let connection_id = handle.connection_id();

        // Act
        let failing = handle.submit(frames(&[(0, 5)])).unwrap();
        let queued = handle.submit(frames(&[(1, 5)])).unwrap();

        // Assert
        assert_eq!(
            failing.await.unwrap(),
            Err(WriteError::Transport("device disconnected".into()))
        );
        assert_eq!(queued.await.unwrap(), Err(WriteError::Cancelled));
        let lost = lost_rx.recv().await.unwrap();
        assert_eq!(lost.device_id, DeviceId::new("mock_1"));
        assert_eq!(lost.connection_id, connection_id);
        assert_eq!(handle.submit(frames(&[(2, 5)])).unwrap_err(), SubmitError::Closed);
    }

    #[tokio::test]
    async fn test_short_write_is_retried_once() {
        // Arrange
        let mut mock = MockVestTransport::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_write_packet()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(4));
        mock.expect_write_packet()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|p| Ok(p.len()));
        mock.expect_close().return_const(());
        let (lost_tx, _lost_rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::spawn(
            DeviceId::new("mock_1"),
            Box::new(mock),
            WriterSettings::default(),
            lost_tx,
        );

        // Act
        let done = handle.submit(frames(&[(4, 4)])).unwrap();

        // Assert
        assert_eq!(done.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_two_short_writes_fail_the_job() {
        let mut mock = MockVestTransport::new();
        mock.expect_write_packet().times(2).returning(|_| Ok(3));
        mock.expect_close().return_const(());
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::spawn(
            DeviceId::new("mock_1"),
            Box::new(mock),
            WriterSettings::default(),
            lost_tx,
        );

        let done = handle.submit(frames(&[(4, 4)])).unwrap();

        assert_eq!(
            done.await.unwrap(),
            Err(WriteError::Transport("short write: 3 of 10 bytes".into()))
        );
        assert!(lost_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_new_jobs() {
        // Arrange: a transport that never gets to run because the runtime is
        // single-threaded and we never yield before submitting.
        let log = Arc::new(Mutex::new(Vec::new()));
        let (lost_tx, _lost_rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::spawn(
            DeviceId::new("mock_1"),
            Box::new(recording_transport(log)),
            WriterSettings {
                queue_depth: 1,
                ..WriterSettings::default()
            },
            lost_tx,
        );

        // Act
        let first = handle.submit(frames(&[(0, 1)]));
        let second = handle.submit(frames(&[(0, 2)]));

        // Assert
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err(), SubmitError::QueueFull);
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_transport() {
        // Arrange
        let (closed_tx, closed_rx) = oneshot::channel();
        let closed_tx = Mutex::new(Some(closed_tx));
        let mut mock = MockVestTransport::new();
        mock.expect_close().returning(move || {
            if let Some(tx) = closed_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });
        let (lost_tx, _lost_rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::spawn(
            DeviceId::new("mock_1"),
            Box::new(mock),
            WriterSettings::default(),
            lost_tx,
        );

        // Act
        handle.close();

        // Assert
        assert!(closed_rx.await.is_ok());
    }
}
