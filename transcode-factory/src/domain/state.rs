//! Job lifecycle state machine.
//!
//! Pure rules only: which state follows which, and which states end a job.
//! Persisting a state is the dispatcher's business.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Lifecycle state of a job.
///
/// `Submitted -> ProbingMetadata -> [BuildingVideoFilter] -> PendingTranscode
/// -> Transcoding -> Success | Failed`, with `Cancelled` reachable from any
/// non-terminal state when the process shuts down.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    ProbingMetadata,
    BuildingVideoFilter,
    PendingTranscode,
    Transcoding,
    Success,
    Failed,
    Cancelled,
}

impl JobState {
    /// Stable name stored in the database.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// Parse a stored state name.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Human-readable description for status views.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::ProbingMetadata => "probing source metadata",
            Self::BuildingVideoFilter => "constructing video filter graph",
            Self::PendingTranscode => "waiting for transcoder slot",
            Self::Transcoding => "copying or transcoding media",
            Self::Success => "completed successfully",
            Self::Failed => "job failed",
            Self::Cancelled => "job cancelled before completion",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` may directly follow `self`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        if next == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Submitted, ProbingMetadata)
                | (ProbingMetadata, BuildingVideoFilter)
                | (ProbingMetadata, PendingTranscode)
                | (ProbingMetadata, Failed)
                | (BuildingVideoFilter, PendingTranscode)
                | (PendingTranscode, Transcoding)
                | (Transcoding, Success)
                | (Transcoding, Failed)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(self, next: JobState) -> Result<JobState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::invalid_transition(self, next))
        }
    }

    /// The state that follows `ProbingMetadata` for a job with these flags.
    pub fn after_probe(autocrop: bool, crop_complete: bool, codec: &str) -> JobState {
        if needs_crop(autocrop, crop_complete, codec) {
            JobState::BuildingVideoFilter
        } else {
            JobState::PendingTranscode
        }
    }
}

/// A job still waits for crop detection.
pub(crate) fn needs_crop(autocrop: bool, crop_complete: bool, codec: &str) -> bool {
    autocrop && !crop_complete && !codec.eq_ignore_ascii_case(super::job::COPY_CODEC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_happy_path_with_crop() {
        let path = [
            JobState::Submitted,
            JobState::ProbingMetadata,
            JobState::BuildingVideoFilter,
            JobState::PendingTranscode,
            JobState::Transcoding,
            JobState::Success,
        ];
        for pair in path.windows(2) {
            assert_eq!(pair[0].advance(pair[1]).unwrap(), pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(JobState::Submitted.advance(JobState::Transcoding).is_err());
        assert!(JobState::PendingTranscode.advance(JobState::BuildingVideoFilter).is_err());
        assert!(JobState::Success.advance(JobState::Failed).is_err());
        assert!(JobState::Failed.advance(JobState::ProbingMetadata).is_err());
    }

    #[test]
    fn test_cancelled_reachable_from_every_non_terminal_state() {
        for state in JobState::iter() {
            assert_eq!(
                state.can_transition_to(JobState::Cancelled),
                !state.is_terminal(),
                "{state}"
            );
        }
    }

    #[test]
    fn test_after_probe() {
        assert_eq!(
            JobState::after_probe(true, false, "libx265"),
            JobState::BuildingVideoFilter
        );
        assert_eq!(
            JobState::after_probe(true, true, "libx265"),
            JobState::PendingTranscode
        );
        assert_eq!(
            JobState::after_probe(false, false, "libx265"),
            JobState::PendingTranscode
        );
        assert_eq!(
            JobState::after_probe(true, false, "COPY"),
            JobState::PendingTranscode
        );
    }

    #[test]
    fn test_round_trip_names() {
        for state in JobState::iter() {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::PendingTranscode.as_str(), "pending_transcode");
        assert_eq!(JobState::parse("bogus"), None);
    }
}
