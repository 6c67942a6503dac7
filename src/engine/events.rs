//! Per-job progress channels with history replay for late subscribers.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;
use uuid::Uuid;

use super::core::{JobStats, JobStatus};

/// Everything a subscriber can observe about a job, serialized as one JSON
/// object per event with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Log {
        job_id: Uuid,
        message: String,
    },
    Progress {
        job_id: Uuid,
        /// Ratio in [0, 1]
        progress: f64,
    },
    Status {
        job_id: Uuid,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Done {
        job_id: Uuid,
        stats: JobStats,
    },
    Error {
        job_id: Uuid,
        message: String,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Log { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Status { job_id, .. }
            | Self::Done { job_id, .. }
            | Self::Error { job_id, .. } => *job_id,
        }
    }

    /// `done`, `error`, and a terminal `status` (cancellation) end a stream.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Done { .. } | Self::Error { .. } => true,
            Self::Status { status, .. } => status.is_terminal(),
            _ => false,
        }
    }

    pub fn log(job_id: Uuid, message: impl Into<String>) -> Self {
        Self::Log {
            job_id,
            message: message.into(),
        }
    }

    pub fn status(job_id: Uuid, status: JobStatus) -> Self {
        Self::Status {
            job_id,
            status,
            message: None,
        }
    }
}

#[derive(Default)]
struct Channel {
    subscribers: Vec<Sender<ProgressEvent>>,
    history: VecDeque<ProgressEvent>,
    closed: bool,
}

/// Fan-out of job events. Publishes to one job are serialized, so every
/// subscriber sees that job's events in publish order.
pub struct ProgressHub {
    channels: Mutex<HashMap<Uuid, Arc<Mutex<Channel>>>>,
    history_len: usize,
}

impl ProgressHub {
    pub fn new(history_len: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            history_len: history_len.max(1),
        }
    }

    fn channel(&self, job_id: Uuid) -> Arc<Mutex<Channel>> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.entry(job_id).or_default().clone()
    }

    /// Publish an event. Returns false if the job's stream already ended, in
    /// which case the event is dropped.
    pub fn publish(&self, event: ProgressEvent) -> bool {
        let channel = self.channel(event.job_id());
        let mut ch = channel.lock().unwrap_or_else(PoisonError::into_inner);
        if ch.closed {
            trace!(job_id = %event.job_id(), "dropping event after terminal");
            return false;
        }

        let terminal = event.is_terminal();
        // Gone receivers are pruned as we go
        ch.subscribers.retain(|tx| tx.send(event.clone()).is_ok());

        // Keep the terminal event even when trimming
        if ch.history.len() >= self.history_len {
            ch.history.pop_front();
        }
        ch.history.push_back(event);

        if terminal {
            ch.closed = true;
            // Dropping the senders ends every subscriber's iterator
            ch.subscribers.clear();
        }
        true
    }

    /// Subscribe to a job. Recent history is replayed first; for a finished
    /// job the receiver yields the replay (terminal event last) and then ends.
    pub fn subscribe(&self, job_id: Uuid) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        let channel = self.channel(job_id);
        let mut ch = channel.lock().unwrap_or_else(PoisonError::into_inner);
        for event in &ch.history {
            let _ = tx.send(event.clone());
        }
        if !ch.closed {
            ch.subscribers.push(tx);
        }
        rx
    }

    /// Forget a job's channel and history entirely.
    pub fn remove(&self, job_id: Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.remove(&job_id);
    }
}
