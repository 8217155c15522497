//! Actions on the signed-in user's own videos.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::data::UploadService;
use crate::feed::FeedLoader;
use crate::notify::{Notifier, Severity};

pub const DELETED_MESSAGE: &str = "Deleted video";
pub const DELETE_FAILED_MESSAGE: &str = "Failed to delete video";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { video_id: String },
    Failed { video_id: String },
}

struct DeleteResponse {
    video_id: String,
    result: Result<()>,
}

pub struct ProfileActions {
    service: Arc<dyn UploadService>,
    notifier: Arc<dyn Notifier>,
    deleting: HashSet<String>,
    response_tx: Sender<DeleteResponse>,
    response_rx: Receiver<DeleteResponse>,
}

impl ProfileActions {
    pub fn new(service: Arc<dyn UploadService>, notifier: Arc<dyn Notifier>) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            service,
            notifier,
            deleting: HashSet::new(),
            response_tx,
            response_rx,
        }
    }

    pub fn is_deleting(&self, video_id: &str) -> bool {
        self.deleting.contains(video_id)
    }

    /// Starts deleting `video_id`. Ignored while a delete for the same id is
    /// still running.
    pub fn delete_video(&mut self, video_id: &str) -> bool {
        if !self.deleting.insert(video_id.to_string()) {
            return false;
        }
        let service = self.service.clone();
        let tx = self.response_tx.clone();
        let video_id = video_id.to_string();
        thread::spawn(move || {
            let result = service.delete_video(&video_id);
            let _ = tx.send(DeleteResponse { video_id, result });
        });
        true
    }

    /// Applies finished deletes, dropping removed videos from `feed`.
    pub fn poll(&mut self, feed: &mut FeedLoader) -> Vec<DeleteOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(response) = self.response_rx.try_recv() {
            outcomes.push(self.apply(response, feed));
        }
        outcomes
    }

    pub fn wait(&mut self, feed: &mut FeedLoader, timeout: Duration) -> Vec<DeleteOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcomes = Vec::new();
        while !self.deleting.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => outcomes.push(self.apply(response, feed)),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        outcomes
    }

    fn apply(&mut self, response: DeleteResponse, feed: &mut FeedLoader) -> DeleteOutcome {
        let DeleteResponse { video_id, result } = response;
        self.deleting.remove(&video_id);
        match result {
            Ok(()) => {
                info!(video_id = %video_id, "video deleted");
                feed.remove(&video_id);
                self.notifier.notify(Severity::Success, DELETED_MESSAGE);
                DeleteOutcome::Deleted { video_id }
            }
            Err(err) => {
                warn!(video_id = %video_id, error = %err, "video delete failed");
                self.notifier.notify(Severity::Error, DELETE_FAILED_MESSAGE);
                DeleteOutcome::Failed { video_id }
            }
        }
    }
}
