//! Post-flush handoff: upload the artifact, then run the downstream trigger.

use tracing::{error, info, warn};

use crate::buffer::Artifact;
use crate::downstream::{DownstreamReport, DownstreamTrigger};
use crate::error::UploadError;
use crate::storage::{UploadReference, Uploader};

#[derive(Debug)]
pub enum PublishOutcome {
    Uploaded {
        reference: UploadReference,
        downstream: Option<DownstreamReport>,
    },
    /// The artifact stays on disk for a later re-upload.
    UploadFailed(UploadError),
}

impl PublishOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, PublishOutcome::Uploaded { .. })
    }
}

pub struct Publisher {
    uploader: Uploader,
    folder: String,
    trigger: Option<DownstreamTrigger>,
}

impl Publisher {
    pub fn new(uploader: Uploader, folder: impl Into<String>) -> Self {
        Self {
            uploader,
            folder: folder.into(),
            trigger: None,
        }
    }

    /// Runs `trigger` after every successful upload.
    pub fn with_trigger(mut self, trigger: DownstreamTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Uploads `artifact` and, on success, triggers the downstream steps.
    ///
    /// Failures are logged and returned as outcomes; the local file is never
    /// removed.
    #[tracing::instrument(skip(self, artifact), fields(artifact = %artifact.file_name, rows = artifact.row_count))]
    pub async fn publish(&self, artifact: &Artifact) -> PublishOutcome {
        let reference = match self.uploader.upload(&artifact.path, &self.folder).await {
            Ok(reference) => reference,
            Err(e) => {
                error!(
                    error = %e,
                    path = %artifact.path.display(),
                    "Upload failed, local artifact retained for re-upload"
                );
                return PublishOutcome::UploadFailed(e);
            }
        };

        let downstream = match &self.trigger {
            Some(trigger) => {
                let report = trigger.trigger(&reference).await;
                if report.is_success() {
                    info!(uri = %reference, "Downstream pipeline complete");
                } else {
                    warn!(uri = %reference, "Downstream pipeline did not complete");
                }
                Some(report)
            }
            None => None,
        };

        PublishOutcome::Uploaded {
            reference,
            downstream,
        }
    }
}
