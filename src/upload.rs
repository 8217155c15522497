//! Upload dialog state and the multi-request upload sequence.
//!
//! A submit creates the video record first, then transfers the video and
//! either transfers the thumbnail or asks the backend to generate one. Once
//! the record exists, any later failure deletes it again before the error is
//! reported, so a failed upload never leaves a record behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::api::{NewVideo, UploadTargets};
use crate::data::UploadService;
use crate::media::{self, LocalAsset, PreviewRef, Previews};
use crate::notify::{Notifier, Severity};

pub const ALLOWED_VIDEO_TYPES: &[&str] = &["video/mp4", "video/webm", "video/ogg"];
pub const ALLOWED_THUMBNAIL_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];
pub const MIN_THUMBNAIL_WIDTH: u32 = 640;

pub const UPLOADED_MESSAGE: &str = "Uploaded video";
pub const FAILED_MESSAGE: &str = "Something went wrong";
pub const CANCELLED_MESSAGE: &str = "Upload cancelled";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid file type. Allowed types: MP4, WebM, OGG")]
    VideoType { content_type: String },
    #[error("Invalid file type. Allowed types: JPEG, PNG, WebP, GIF")]
    ThumbnailType { content_type: String },
    #[error("Thumbnail must be at least {min}px wide.")]
    ThumbnailTooNarrow { width: u32, min: u32 },
    #[error("Thumbnail could not be read as an image.")]
    ThumbnailUnreadable,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("create video metadata failed")]
    CreateMetadata(#[source] anyhow::Error),
    #[error("video transfer failed for {video_id}")]
    VideoTransfer {
        video_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("thumbnail transfer failed for {video_id}")]
    ThumbnailTransfer {
        video_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("thumbnail generation failed for {video_id}")]
    ThumbnailGeneration {
        video_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("backend returned no thumbnail upload target for {video_id}")]
    MissingThumbnailTarget { video_id: String },
    #[error("upload cancelled")]
    Cancelled { video_id: Option<String> },
}

impl UploadError {
    pub fn video_id(&self) -> Option<&str> {
        match self {
            UploadError::CreateMetadata(_) => None,
            UploadError::VideoTransfer { video_id, .. }
            | UploadError::ThumbnailTransfer { video_id, .. }
            | UploadError::ThumbnailGeneration { video_id, .. }
            | UploadError::MissingThumbnailTarget { video_id } => Some(video_id),
            UploadError::Cancelled { video_id } => video_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("a title is required")]
    MissingTitle,
    #[error("a video file is required")]
    MissingVideo,
    #[error("an upload is already in progress")]
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAsset {
    pub asset: LocalAsset,
    pub preview: PreviewRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadDraft {
    pub title: String,
    pub description: String,
    pub video_asset: Option<SelectedAsset>,
    pub thumbnail_asset: Option<SelectedAsset>,
    /// Set once the backend has confirmed the metadata record.
    pub video_id: Option<String>,
}

/// Everything the upload sequence needs, detached from the draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub title: String,
    pub description: String,
    pub video: LocalAsset,
    pub thumbnail: Option<LocalAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    MetadataCreated { video_id: String },
    VideoTransferred,
    ThumbnailTransferred,
    ThumbnailRequested,
}

/// Runs the upload sequence, rolling back the created record on failure.
///
/// `cancel` is checked between steps; a set flag counts as a failure.
pub fn run_upload(
    service: &dyn UploadService,
    job: &UploadJob,
    cancel: &AtomicBool,
    mut on_step: impl FnMut(Step),
) -> Result<String, UploadError> {
    if cancel.load(Ordering::SeqCst) {
        return Err(UploadError::Cancelled { video_id: None });
    }
    let metadata = NewVideo {
        title: job.title.trim().to_string(),
        description: job.description.clone(),
        video_content_type: job.video.content_type.clone(),
        thumbnail_content_type: job.thumbnail.as_ref().map(|t| t.content_type.clone()),
    };
    let targets = service
        .create_video_metadata(&metadata)
        .map_err(UploadError::CreateMetadata)?;
    let video_id = targets.video_id.clone();
    on_step(Step::MetadataCreated {
        video_id: video_id.clone(),
    });

    match transfer_assets(service, job, &targets, cancel, &mut on_step) {
        Ok(()) => Ok(video_id),
        Err(err) => {
            warn!(video_id = %video_id, error = %err, "upload step failed, rolling back");
            rollback(service, &video_id);
            Err(err)
        }
    }
}

fn transfer_assets(
    service: &dyn UploadService,
    job: &UploadJob,
    targets: &UploadTargets,
    cancel: &AtomicBool,
    on_step: &mut impl FnMut(Step),
) -> Result<(), UploadError> {
    let video_id = &targets.video_id;
    let cancelled = || {
        cancel.load(Ordering::SeqCst).then(|| UploadError::Cancelled {
            video_id: Some(video_id.clone()),
        })
    };

    if let Some(err) = cancelled() {
        return Err(err);
    }
    service
        .put_asset(&targets.video_upload_target, &job.video)
        .map_err(|source| UploadError::VideoTransfer {
            video_id: video_id.clone(),
            source,
        })?;
    on_step(Step::VideoTransferred);

    if let Some(err) = cancelled() {
        return Err(err);
    }
    match &job.thumbnail {
        Some(thumbnail) => {
            let target = targets.thumbnail_upload_target.as_deref().ok_or_else(|| {
                UploadError::MissingThumbnailTarget {
                    video_id: video_id.clone(),
                }
            })?;
            service
                .put_asset(target, thumbnail)
                .map_err(|source| UploadError::ThumbnailTransfer {
                    video_id: video_id.clone(),
                    source,
                })?;
            on_step(Step::ThumbnailTransferred);
        }
        None => {
            service
                .generate_thumbnail(video_id)
                .map_err(|source| UploadError::ThumbnailGeneration {
                    video_id: video_id.clone(),
                    source,
                })?;
            on_step(Step::ThumbnailRequested);
        }
    }

    match cancelled() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn rollback(service: &dyn UploadService, video_id: &str) {
    match service.delete_video(video_id) {
        Ok(()) => info!(video_id, "rolled back partial upload"),
        Err(err) => error!(video_id, error = %err, "rollback failed; video record left behind"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub min_thumbnail_width: u32,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            min_thumbnail_width: MIN_THUMBNAIL_WIDTH,
        }
    }
}

/// Terminal result of a submit, handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The video is live; the caller should refresh its feed.
    Uploaded { video_id: String },
    Failed,
    Cancelled,
}

struct PendingSubmit {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
}

enum UploadResponse {
    Step {
        request_id: u64,
        step: Step,
    },
    Finished {
        request_id: u64,
        result: Result<String, UploadError>,
    },
}

pub struct Coordinator {
    service: Arc<dyn UploadService>,
    notifier: Arc<dyn Notifier>,
    previews: Previews,
    options: UploadOptions,
    draft: UploadDraft,
    video_error: Option<ValidationError>,
    thumbnail_error: Option<ValidationError>,
    last_failure: Option<UploadError>,
    next_request_id: u64,
    pending: Option<PendingSubmit>,
    response_tx: Sender<UploadResponse>,
    response_rx: Receiver<UploadResponse>,
}

impl Coordinator {
    /// Opens the upload dialog with an empty draft.
    pub fn new(
        service: Arc<dyn UploadService>,
        notifier: Arc<dyn Notifier>,
        previews: Previews,
        options: UploadOptions,
    ) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            service,
            notifier,
            previews,
            options,
            draft: UploadDraft::default(),
            video_error: None,
            thumbnail_error: None,
            last_failure: None,
            next_request_id: 1,
            pending: None,
            response_tx,
            response_rx,
        }
    }

    pub fn draft(&self) -> &UploadDraft {
        &self.draft
    }

    pub fn video_error(&self) -> Option<&ValidationError> {
        self.video_error.as_ref()
    }

    pub fn thumbnail_error(&self) -> Option<&ValidationError> {
        self.thumbnail_error.as_ref()
    }

    pub fn last_failure(&self) -> Option<&UploadError> {
        self.last_failure.as_ref()
    }

    pub fn is_submitting(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.draft.title = title.into();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.draft.description = description.into();
    }

    pub fn select_video_asset(&mut self, asset: LocalAsset) -> Result<PreviewRef, ValidationError> {
        self.clear_video_asset();
        if !ALLOWED_VIDEO_TYPES.contains(&asset.content_type.as_str()) {
            let err = ValidationError::VideoType {
                content_type: asset.content_type,
            };
            self.video_error = Some(err.clone());
            return Err(err);
        }
        let preview = self.previews.create(&asset);
        self.draft.video_asset = Some(SelectedAsset {
            asset,
            preview: preview.clone(),
        });
        Ok(preview)
    }

    pub fn select_thumbnail_asset(
        &mut self,
        asset: LocalAsset,
    ) -> Result<PreviewRef, ValidationError> {
        self.clear_thumbnail_asset();
        if let Err(err) = self.validate_thumbnail(&asset) {
            self.thumbnail_error = Some(err.clone());
            return Err(err);
        }
        let preview = self.previews.create(&asset);
        self.draft.thumbnail_asset = Some(SelectedAsset {
            asset,
            preview: preview.clone(),
        });
        Ok(preview)
    }

    fn validate_thumbnail(&self, asset: &LocalAsset) -> Result<(), ValidationError> {
        if !ALLOWED_THUMBNAIL_TYPES.contains(&asset.content_type.as_str()) {
            return Err(ValidationError::ThumbnailType {
                content_type: asset.content_type.clone(),
            });
        }
        let (width, _) = media::image_dimensions(&asset.path).map_err(|err| {
            debug!(path = %asset.path.display(), error = %err, "thumbnail decode failed");
            ValidationError::ThumbnailUnreadable
        })?;
        let min = self.options.min_thumbnail_width;
        if width < min {
            return Err(ValidationError::ThumbnailTooNarrow { width, min });
        }
        Ok(())
    }

    pub fn clear_video_asset(&mut self) {
        self.video_error = None;
        if let Some(selected) = self.draft.video_asset.take() {
            self.previews.revoke(&selected.preview);
        }
    }

    pub fn clear_thumbnail_asset(&mut self) {
        self.thumbnail_error = None;
        if let Some(selected) = self.draft.thumbnail_asset.take() {
            self.previews.revoke(&selected.preview);
        }
    }

    pub fn can_submit(&self) -> bool {
        self.check_ready().is_ok()
    }

    fn check_ready(&self) -> Result<&SelectedAsset, SubmitError> {
        if self.pending.is_some() {
            return Err(SubmitError::InFlight);
        }
        if self.draft.title.trim().is_empty() {
            return Err(SubmitError::MissingTitle);
        }
        self.draft
            .video_asset
            .as_ref()
            .ok_or(SubmitError::MissingVideo)
    }

    pub fn submit(&mut self) -> Result<(), SubmitError> {
        let video = self.check_ready()?.asset.clone();
        let job = UploadJob {
            title: self.draft.title.clone(),
            description: self.draft.description.clone(),
            video,
            thumbnail: self
                .draft
                .thumbnail_asset
                .as_ref()
                .map(|selected| selected.asset.clone()),
        };

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending = Some(PendingSubmit {
            request_id,
            cancel_flag: cancel_flag.clone(),
        });
        self.last_failure = None;
        debug!(request_id, title = %job.title, "starting upload");

        let service = self.service.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let step_tx = tx.clone();
            let result = run_upload(service.as_ref(), &job, &cancel_flag, |step| {
                let _ = step_tx.send(UploadResponse::Step { request_id, step });
            });
            let _ = tx.send(UploadResponse::Finished { request_id, result });
        });
        Ok(())
    }

    /// Applies finished work. Returns the outcome once a submit completes.
    pub fn poll(&mut self) -> Option<UploadOutcome> {
        let mut outcome = None;
        while let Ok(response) = self.response_rx.try_recv() {
            if let Some(done) = self.apply(response) {
                outcome = Some(done);
            }
        }
        outcome
    }

    pub fn wait(&mut self, timeout: Duration) -> Option<UploadOutcome> {
        let deadline = Instant::now() + timeout;
        while self.pending.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => {
                    if let Some(outcome) = self.apply(response) {
                        return Some(outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
        None
    }

    /// Closes the dialog: releases previews and discards the draft. An
    /// in-flight submit is told to stop and roll back.
    pub fn close(&mut self) {
        if let Some(pending) = &self.pending {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        self.discard_draft();
    }

    fn discard_draft(&mut self) {
        self.clear_video_asset();
        self.clear_thumbnail_asset();
        self.draft = UploadDraft::default();
    }

    fn apply(&mut self, response: UploadResponse) -> Option<UploadOutcome> {
        let pending = self.pending.as_ref()?;
        match response {
            UploadResponse::Step { request_id, step } => {
                if pending.request_id != request_id {
                    return None;
                }
                let cancelled = pending.cancel_flag.load(Ordering::SeqCst);
                if let Step::MetadataCreated { video_id } = step {
                    if !cancelled {
                        self.draft.video_id = Some(video_id);
                    }
                }
                None
            }
            UploadResponse::Finished { request_id, result } => {
                if pending.request_id != request_id {
                    return None;
                }
                let cancelled = pending.cancel_flag.load(Ordering::SeqCst);
                self.pending = None;
                Some(self.finish(result, cancelled))
            }
        }
    }

    fn finish(&mut self, result: Result<String, UploadError>, cancelled: bool) -> UploadOutcome {
        match result {
            Ok(video_id) => {
                info!(video_id = %video_id, "upload complete");
                if !cancelled {
                    self.discard_draft();
                }
                self.notifier.notify(Severity::Success, UPLOADED_MESSAGE);
                UploadOutcome::Uploaded { video_id }
            }
            Err(UploadError::Cancelled { video_id }) => {
                info!(video_id = ?video_id, "upload cancelled");
                self.draft.video_id = None;
                self.notifier.notify(Severity::Error, CANCELLED_MESSAGE);
                UploadOutcome::Cancelled
            }
            Err(err) => {
                warn!(error = %err, "upload failed");
                self.draft.video_id = None;
                self.last_failure = Some(err);
                self.notifier.notify(Severity::Error, FAILED_MESSAGE);
                UploadOutcome::Failed
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testutil::{write_bytes, write_png};
    use crate::notify::{ChannelNotifier, Notification};
    use anyhow::{anyhow, Result};
    use parking_lot::Mutex;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Create(NewVideo),
        Put { target: String, name: String },
        Generate(String),
        Delete(String),
    }

    #[derive(Default)]
    struct FakeUploads {
        video_id: String,
        fail_create: bool,
        fail_video_put: bool,
        fail_thumbnail_put: bool,
        fail_generate: bool,
        fail_delete: bool,
        calls: Mutex<Vec<Call>>,
        gate: Option<Receiver<()>>,
    }

    impl FakeUploads {
        fn with_id(video_id: &str) -> Self {
            Self {
                video_id: video_id.to_string(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn deletes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Delete(id) => Some(id),
                    _ => None,
                })
                .collect()
        }
    }

    impl UploadService for FakeUploads {
        fn create_video_metadata(&self, video: &NewVideo) -> Result<UploadTargets> {
            self.calls.lock().push(Call::Create(video.clone()));
            if self.fail_create {
                return Err(anyhow!("backend unavailable"));
            }
            Ok(UploadTargets {
                video_id: self.video_id.clone(),
                video_upload_target: format!("https://storage.test/{}/video", self.video_id),
                thumbnail_upload_target: video
                    .thumbnail_content_type
                    .as_ref()
                    .map(|_| format!("https://storage.test/{}/thumb", self.video_id)),
            })
        }

        fn put_asset(&self, target: &str, asset: &LocalAsset) -> Result<()> {
            self.calls.lock().push(Call::Put {
                target: target.to_string(),
                name: asset.name.clone(),
            });
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            let is_thumb = target.ends_with("/thumb");
            if (is_thumb && self.fail_thumbnail_put) || (!is_thumb && self.fail_video_put) {
                return Err(anyhow!("signed url expired"));
            }
            Ok(())
        }

        fn generate_thumbnail(&self, video_id: &str) -> Result<()> {
            self.calls.lock().push(Call::Generate(video_id.to_string()));
            if self.fail_generate {
                return Err(anyhow!("thumbnail worker offline"));
            }
            Ok(())
        }

        fn delete_video(&self, video_id: &str) -> Result<()> {
            self.calls.lock().push(Call::Delete(video_id.to_string()));
            if self.fail_delete {
                return Err(anyhow!("delete refused"));
            }
            Ok(())
        }
    }

    struct Harness {
        dir: TempDir,
        fake: Arc<FakeUploads>,
        previews: Previews,
        notes: Receiver<Notification>,
        coordinator: Coordinator,
    }

    fn harness(fake: FakeUploads) -> Harness {
        let dir = tempdir().unwrap();
        let fake = Arc::new(fake);
        let previews = Previews::new();
        let (notifier, notes) = ChannelNotifier::new();
        let coordinator = Coordinator::new(
            fake.clone(),
            Arc::new(notifier),
            previews.clone(),
            UploadOptions::default(),
        );
        Harness {
            dir,
            fake,
            previews,
            notes,
            coordinator,
        }
    }

    fn video(dir: &Path) -> LocalAsset {
        let path = write_bytes(dir, "clip.mp4", b"\0\0\0\x18ftypmp42 not really a video");
        LocalAsset::with_content_type(path, "video/mp4").unwrap()
    }

    fn thumbnail(dir: &Path, width: u32) -> LocalAsset {
        LocalAsset::open(write_png(dir, &format!("thumb-{width}.png"), width, 360)).unwrap()
    }

    #[test]
    fn upload_without_thumbnail_requests_generation() {
        let mut h = harness(FakeUploads::with_id("v1"));
        h.coordinator.set_title("My trip");
        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        assert!(h.coordinator.can_submit());
        h.coordinator.submit().unwrap();
        assert!(!h.coordinator.can_submit());

        let outcome = h.coordinator.wait(WAIT);
        assert_eq!(
            outcome,
            Some(UploadOutcome::Uploaded {
                video_id: "v1".into()
            })
        );
        let calls = h.fake.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], Call::Create(meta) if meta.thumbnail_content_type.is_none()));
        assert_eq!(
            calls[1],
            Call::Put {
                target: "https://storage.test/v1/video".into(),
                name: "clip.mp4".into()
            }
        );
        assert_eq!(calls[2], Call::Generate("v1".into()));

        let notes: Vec<_> = h.notes.try_iter().collect();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Success);
        assert_eq!(notes[0].message, UPLOADED_MESSAGE);
        assert_eq!(h.coordinator.draft(), &UploadDraft::default());
        assert_eq!(h.previews.live(), 0);
    }

    #[test]
    fn upload_with_thumbnail_transfers_it() {
        let mut h = harness(FakeUploads::with_id("v7"));
        h.coordinator.set_title("Sunset");
        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        h.coordinator
            .select_thumbnail_asset(thumbnail(h.dir.path(), 1280))
            .unwrap();
        assert_eq!(h.previews.live(), 2);
        h.coordinator.submit().unwrap();
        assert!(matches!(
            h.coordinator.wait(WAIT),
            Some(UploadOutcome::Uploaded { .. })
        ));

        let calls = h.fake.calls();
        assert!(
            matches!(&calls[0], Call::Create(meta) if meta.thumbnail_content_type.as_deref() == Some("image/png"))
        );
        assert_eq!(
            calls[2],
            Call::Put {
                target: "https://storage.test/v7/thumb".into(),
                name: "thumb-1280.png".into()
            }
        );
        assert!(!calls.iter().any(|call| matches!(call, Call::Generate(_))));
        assert_eq!(h.previews.live(), 0);
    }

    #[test]
    fn failed_video_transfer_rolls_back_once() {
        let mut h = harness(FakeUploads {
            fail_video_put: true,
            ..FakeUploads::with_id("v2")
        });
        h.coordinator.set_title("Broken");
        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        h.coordinator.submit().unwrap();

        assert_eq!(h.coordinator.wait(WAIT), Some(UploadOutcome::Failed));
        assert_eq!(h.fake.deletes(), vec!["v2".to_string()]);
        assert!(!h
            .fake
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Generate(_))));

        let notes: Vec<_> = h.notes.try_iter().collect();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Error);
        assert_eq!(notes[0].message, FAILED_MESSAGE);

        // The draft survives for a retry, minus the rolled back record.
        assert_eq!(h.coordinator.draft().title, "Broken");
        assert!(h.coordinator.draft().video_asset.is_some());
        assert_eq!(h.coordinator.draft().video_id, None);
        assert!(h.coordinator.can_submit());
    }

    #[test]
    fn rollback_failure_does_not_mask_original_error() {
        let mut h = harness(FakeUploads {
            fail_thumbnail_put: true,
            fail_delete: true,
            ..FakeUploads::with_id("v3")
        });
        h.coordinator.set_title("Twice broken");
        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        h.coordinator
            .select_thumbnail_asset(thumbnail(h.dir.path(), 640))
            .unwrap();
        h.coordinator.submit().unwrap();

        assert_eq!(h.coordinator.wait(WAIT), Some(UploadOutcome::Failed));
        assert_eq!(h.fake.deletes(), vec!["v3".to_string()]);
        assert!(matches!(
            h.coordinator.last_failure(),
            Some(UploadError::ThumbnailTransfer { video_id, .. }) if video_id == "v3"
        ));
        assert_eq!(h.notes.try_iter().count(), 1);
    }

    #[test]
    fn failed_thumbnail_generation_rolls_back() {
        let mut h = harness(FakeUploads {
            fail_generate: true,
            ..FakeUploads::with_id("vX")
        });
        h.coordinator.set_title("No preview");
        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        h.coordinator.submit().unwrap();

        assert_eq!(h.coordinator.wait(WAIT), Some(UploadOutcome::Failed));
        assert_eq!(h.fake.deletes(), vec!["vX".to_string()]);
        assert!(matches!(
            h.coordinator.last_failure(),
            Some(UploadError::ThumbnailGeneration { video_id, .. }) if video_id == "vX"
        ));
        let calls = h.fake.calls();
        assert_eq!(calls[2], Call::Generate("vX".into()));
        assert_eq!(calls[3], Call::Delete("vX".into()));

        let notes: Vec<_> = h.notes.try_iter().collect();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Error);
        assert_eq!(notes[0].message, FAILED_MESSAGE);
    }

    #[test]
    fn failed_metadata_creation_needs_no_rollback() {
        let mut h = harness(FakeUploads {
            fail_create: true,
            ..FakeUploads::with_id("never")
        });
        h.coordinator.set_title("Nope");
        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        h.coordinator.submit().unwrap();
        assert_eq!(h.coordinator.wait(WAIT), Some(UploadOutcome::Failed));
        assert!(h.fake.deletes().is_empty());
        assert_eq!(h.fake.calls().len(), 1);
    }

    #[test]
    fn narrow_thumbnail_is_rejected_locally() {
        let mut h = harness(FakeUploads::with_id("v4"));
        let err = h
            .coordinator
            .select_thumbnail_asset(thumbnail(h.dir.path(), 320))
            .unwrap_err();
        assert_eq!(err, ValidationError::ThumbnailTooNarrow { width: 320, min: 640 });
        assert_eq!(err.to_string(), "Thumbnail must be at least 640px wide.");
        assert_eq!(h.coordinator.thumbnail_error(), Some(&err));
        assert!(h.coordinator.draft().thumbnail_asset.is_none());
        assert!(h.fake.calls().is_empty());
        assert_eq!(h.previews.live(), 0);
    }

    #[test]
    fn wrong_types_get_distinct_messages() {
        let mut h = harness(FakeUploads::with_id("v5"));
        let text = write_bytes(h.dir.path(), "notes.txt", b"hello");
        let asset = LocalAsset::with_content_type(&text, "text/plain").unwrap();

        let err = h.coordinator.select_video_asset(asset.clone()).unwrap_err();
        assert_eq!(err.to_string(), "Invalid file type. Allowed types: MP4, WebM, OGG");
        let err = h.coordinator.select_thumbnail_asset(asset).unwrap_err();
        assert_eq!(err.to_string(), "Invalid file type. Allowed types: JPEG, PNG, WebP, GIF");

        let fake_png = LocalAsset::with_content_type(&text, "image/png").unwrap();
        let err = h.coordinator.select_thumbnail_asset(fake_png).unwrap_err();
        assert_eq!(err, ValidationError::ThumbnailUnreadable);
        assert!(h.fake.calls().is_empty());
    }

    #[test]
    fn rejected_selection_replaces_previous_one() {
        let mut h = harness(FakeUploads::with_id("v6"));
        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        assert_eq!(h.previews.live(), 1);
        let text = write_bytes(h.dir.path(), "notes.txt", b"hello");
        let bad = LocalAsset::with_content_type(&text, "text/plain").unwrap();
        assert!(h.coordinator.select_video_asset(bad).is_err());
        assert!(h.coordinator.draft().video_asset.is_none());
        assert_eq!(h.previews.live(), 0);
    }

    #[test]
    fn select_then_clear_restores_draft() {
        let mut h = harness(FakeUploads::with_id("v8"));
        h.coordinator.set_title("Keep me");
        let before = h.coordinator.draft().clone();

        let preview = h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        assert_eq!(h.previews.live(), 1);
        assert!(h.previews.resolve(&preview).is_some());

        h.coordinator.clear_video_asset();
        assert_eq!(h.coordinator.draft(), &before);
        assert_eq!(h.previews.live(), 0);
        assert!(h.previews.resolve(&preview).is_none());
    }

    #[test]
    fn superseded_selection_releases_old_preview() {
        let mut h = harness(FakeUploads::with_id("v9"));
        let first = h
            .coordinator
            .select_thumbnail_asset(thumbnail(h.dir.path(), 700))
            .unwrap();
        let second = h
            .coordinator
            .select_thumbnail_asset(thumbnail(h.dir.path(), 900))
            .unwrap();
        assert!(h.previews.resolve(&first).is_none());
        assert!(h.previews.resolve(&second).is_some());
        assert_eq!(h.previews.live(), 1);
    }

    #[test]
    fn submit_is_gated() {
        let (gate_tx, gate_rx) = unbounded();
        let mut h = harness(FakeUploads {
            gate: Some(gate_rx),
            ..FakeUploads::with_id("v10")
        });
        assert_eq!(h.coordinator.submit(), Err(SubmitError::MissingTitle));
        h.coordinator.set_title("   ");
        assert_eq!(h.coordinator.submit(), Err(SubmitError::MissingTitle));
        h.coordinator.set_title("Title");
        assert_eq!(h.coordinator.submit(), Err(SubmitError::MissingVideo));

        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        h.coordinator.submit().unwrap();
        assert!(h.coordinator.is_submitting());
        assert_eq!(h.coordinator.submit(), Err(SubmitError::InFlight));

        gate_tx.send(()).unwrap();
        assert!(matches!(
            h.coordinator.wait(WAIT),
            Some(UploadOutcome::Uploaded { .. })
        ));
        let creates = h
            .fake
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Create(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn closing_during_submit_rolls_back() {
        let (gate_tx, gate_rx) = unbounded();
        let mut h = harness(FakeUploads {
            gate: Some(gate_rx),
            ..FakeUploads::with_id("v11")
        });
        h.coordinator.set_title("Abandoned");
        h.coordinator.select_video_asset(video(h.dir.path())).unwrap();
        h.coordinator.submit().unwrap();

        let deadline = Instant::now() + WAIT;
        while !h.fake.calls().iter().any(|call| matches!(call, Call::Put { .. })) {
            assert!(Instant::now() < deadline, "video transfer never started");
            thread::sleep(Duration::from_millis(5));
        }
        h.coordinator.close();
        assert_eq!(h.previews.live(), 0);
        assert_eq!(h.coordinator.draft(), &UploadDraft::default());

        gate_tx.send(()).unwrap();
        assert_eq!(h.coordinator.wait(WAIT), Some(UploadOutcome::Cancelled));
        assert_eq!(h.fake.deletes(), vec!["v11".to_string()]);
        assert_eq!(h.coordinator.draft().video_id, None);
        let notes: Vec<_> = h.notes.try_iter().collect();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message, CANCELLED_MESSAGE);
    }

    #[test]
    fn run_upload_reports_steps_in_order() {
        let dir = tempdir().unwrap();
        let fake = FakeUploads::with_id("v12");
        let job = UploadJob {
            title: "  padded  ".into(),
            description: "desc".into(),
            video: video(dir.path()),
            thumbnail: None,
        };
        let mut steps = Vec::new();
        let id = run_upload(&fake, &job, &AtomicBool::new(false), |step| steps.push(step)).unwrap();
        assert_eq!(id, "v12");
        assert_eq!(
            steps,
            vec![
                Step::MetadataCreated {
                    video_id: "v12".into()
                },
                Step::VideoTransferred,
                Step::ThumbnailRequested,
            ]
        );
        assert!(matches!(&fake.calls()[0], Call::Create(meta) if meta.title == "padded"));
    }

    #[test]
    fn dropping_coordinator_releases_previews() {
        let dir = tempdir().unwrap();
        let previews = Previews::new();
        {
            let (notifier, _notes) = ChannelNotifier::new();
            let mut coordinator = Coordinator::new(
                Arc::new(FakeUploads::with_id("v13")),
                Arc::new(notifier),
                previews.clone(),
                UploadOptions::default(),
            );
            coordinator.select_video_asset(video(dir.path())).unwrap();
            assert_eq!(previews.live(), 1);
        }
        assert_eq!(previews.live(), 0);
    }
}
