use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    New,
    TextProcessed,
    AwaitingReview,
    ReadyToPublish,
    Approved,
    Scheduled,
    Publishing,
    Published,
    Rejected,
    WaitingManual,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown post status: {0}")]
pub struct UnknownStatus(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("post in status {from} cannot move to {to}")]
pub struct TransitionError {
    pub from: PostStatus,
    pub to: PostStatus,
}

const PRE_PUBLISH: &[PostStatus] = &[
    PostStatus::New,
    PostStatus::TextProcessed,
    PostStatus::AwaitingReview,
    PostStatus::ReadyToPublish,
    PostStatus::WaitingManual,
    PostStatus::Approved,
    PostStatus::Scheduled,
];

impl PostStatus {
    pub const ALL: [PostStatus; 10] = [
        Self::New,
        Self::TextProcessed,
        Self::AwaitingReview,
        Self::ReadyToPublish,
        Self::Approved,
        Self::Scheduled,
        Self::Publishing,
        Self::Published,
        Self::Rejected,
        Self::WaitingManual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::TextProcessed => "text_processed",
            Self::AwaitingReview => "awaiting_review",
            Self::ReadyToPublish => "ready_to_publish",
            Self::Approved => "approved",
            Self::Scheduled => "scheduled",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Rejected => "rejected",
            Self::WaitingManual => "waiting_manual",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::Rejected)
    }

    /// States an operator may still approve, schedule, reject or edit.
    pub fn is_pre_publish(self) -> bool {
        PRE_PUBLISH.contains(&self)
    }

    /// States in which a post must carry a target channel.
    pub fn requires_target(self) -> bool {
        matches!(
            self,
            Self::ReadyToPublish | Self::Scheduled | Self::Publishing | Self::Published
        )
    }

    pub fn can_transition_to(self, next: PostStatus) -> bool {
        Transition::ALL
            .iter()
            .any(|t| t.target() == next && t.sources().contains(&self))
    }

    pub fn check_transition(self, next: PostStatus) -> Result<(), TransitionError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PostStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Every allowed lifecycle edge, named by the operation that performs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Rewriting finished (or was skipped).
    TextProcessed,
    /// Confident match to a target without auto-publish.
    RouteToReview,
    /// Confident match to an auto-publish target.
    RouteToAutoPublish,
    /// No confident routing possible.
    RouteToManual,
    /// Classifier approves on behalf of an auto-publish target.
    AutoApprove,
    Approve,
    Schedule,
    /// Operator requests immediate delivery.
    PublishNow,
    Reject,
    Published,
}

impl Transition {
    pub const ALL: [Transition; 10] = [
        Self::TextProcessed,
        Self::RouteToReview,
        Self::RouteToAutoPublish,
        Self::RouteToManual,
        Self::AutoApprove,
        Self::Approve,
        Self::Schedule,
        Self::PublishNow,
        Self::Reject,
        Self::Published,
    ];

    pub fn sources(self) -> &'static [PostStatus] {
        use PostStatus::*;
        match self {
            Self::TextProcessed => &[New],
            Self::RouteToReview | Self::RouteToAutoPublish => &[TextProcessed],
            Self::RouteToManual => &[New, TextProcessed, AwaitingReview, ReadyToPublish],
            Self::AutoApprove => &[ReadyToPublish],
            Self::Approve | Self::Schedule | Self::Reject => PRE_PUBLISH,
            Self::PublishNow => &[Approved, Scheduled],
            Self::Published => &[Scheduled, Publishing],
        }
    }

    pub fn target(self) -> PostStatus {
        match self {
            Self::TextProcessed => PostStatus::TextProcessed,
            Self::RouteToReview => PostStatus::AwaitingReview,
            Self::RouteToAutoPublish => PostStatus::ReadyToPublish,
            Self::RouteToManual => PostStatus::WaitingManual,
            Self::AutoApprove | Self::PublishNow => PostStatus::Publishing,
            Self::Approve => PostStatus::Approved,
            Self::Schedule => PostStatus::Scheduled,
            Self::Reject => PostStatus::Rejected,
            Self::Published => PostStatus::Published,
        }
    }

    pub fn allows(self, from: PostStatus) -> bool {
        self.sources().contains(&from)
    }

    pub fn check(self, from: PostStatus) -> Result<(), TransitionError> {
        if self.allows(from) {
            Ok(())
        } else {
            Err(TransitionError {
                from,
                to: self.target(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in PostStatus::ALL {
            assert_eq!(status.as_str().parse::<PostStatus>().unwrap(), status);
        }
        assert_eq!(
            "Awaiting-Review".parse::<PostStatus>().unwrap(),
            PostStatus::AwaitingReview
        );
        assert!("draft".parse::<PostStatus>().is_err());
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for terminal in [PostStatus::Published, PostStatus::Rejected] {
            for next in PostStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn published_is_only_reached_from_delivery_states() {
        for from in PostStatus::ALL {
            let expected = matches!(from, PostStatus::Scheduled | PostStatus::Publishing);
            assert_eq!(from.can_transition_to(PostStatus::Published), expected, "{from}");
        }
    }

    #[test]
    fn reject_and_manual_reachable_from_pre_publish_states() {
        for from in PostStatus::ALL.into_iter().filter(|s| s.is_pre_publish()) {
            assert!(from.can_transition_to(PostStatus::Rejected), "{from}");
        }
        assert!(PostStatus::TextProcessed.can_transition_to(PostStatus::WaitingManual));
        assert!(!PostStatus::Publishing.can_transition_to(PostStatus::Rejected));
    }

    #[test]
    fn publishing_entered_by_auto_approve_or_operator() {
        assert!(Transition::AutoApprove.allows(PostStatus::ReadyToPublish));
        assert!(!Transition::AutoApprove.allows(PostStatus::AwaitingReview));
        assert!(Transition::PublishNow.allows(PostStatus::Approved));
        assert_eq!(
            Transition::PublishNow.check(PostStatus::New),
            Err(TransitionError {
                from: PostStatus::New,
                to: PostStatus::Publishing
            })
        );
    }
}
