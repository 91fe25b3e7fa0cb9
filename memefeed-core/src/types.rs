use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

/// Dimensionality of post embeddings produced by the content-embedding model.
pub const EMBEDDING_DIM: usize = 1536;

pub type UserId = Uuid;
pub type PostId = Uuid;

/// A content embedding or a derived preference vector.
pub type Embedding = Vec<f64>;

macro_rules! string_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(CoreError::InvalidInput {
                        message: format!("unknown {}: {}", $what, other),
                    }),
                }
            }
        }
    };
}

string_enum!(ReactionKind, "reaction kind", {
    Like => "LIKE",
    Dislike => "DISLIKE",
    Love => "LOVE",
    Laugh => "LAUGH",
    Wow => "WOW",
    Sad => "SAD",
    Angry => "ANGRY",
    Insightful => "INSIGHTFUL",
});

string_enum!(PostType, "post type", {
    Image => "IMAGE",
    Video => "VIDEO",
});

string_enum!(PostStatus, "post status", {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

string_enum!(ReportReason, "report reason", {
    SimplyDisliked => "SIMPLY_DISLIKED",
    BullyingOrUnwantedContact => "BULLYING_OR_UNWANTED_CONTACT",
    SuicideSelfHarmOrEatingDisorders => "SUICIDE_SELF_HARM_OR_EATING_DISORDERS",
    ViolenceHateOrExploitation => "VIOLENCE_HATE_OR_EXPLOITATION",
    SaleOrPromotionOfRestrictedItems => "SALE_OR_PROMOTION_OF_RESTRICTED_ITEMS",
    NudityOrSexualActivity => "NUDITY_OR_SEXUAL_ACTIVITY",
    ScamFraudOrSpam => "SCAM_FRAUD_OR_SPAM",
    Misinformation => "MISINFORMATION",
});

string_enum!(ReportStatus, "report status", {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub external_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub preferences_embedding: Option<Embedding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub title: Option<String>,
    pub description: Option<String>,
    pub post_type: Option<PostType>,
    pub status: PostStatus,
    pub provider: Option<String>,
    pub external_link: Option<String>,
    pub keywords: Vec<String>,
    pub embedding: Option<Embedding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a post is first ingested; metadata and the embedding
/// arrive later from enrichment.
#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub post_type: Option<PostType>,
    pub provider: Option<String>,
    pub external_link: Option<String>,
    pub description: Option<String>,
}

/// Criteria for listing posts. Empty lists and `None` bounds match everything;
/// both date bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub statuses: Vec<PostStatus>,
    pub post_types: Vec<PostType>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    pub post_id: PostId,
    pub kind: ReactionKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of aggregator input: the stored kind name (which may no longer be a
/// known [`ReactionKind`]) and the reacted post's embedding, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionInput {
    pub kind: String,
    pub embedding: Option<Embedding>,
}

impl ReactionInput {
    pub fn new(kind: impl Into<String>, embedding: Option<Embedding>) -> Self {
        Self {
            kind: kind.into(),
            embedding,
        }
    }
}

/// What a reaction write did to the (user, post) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

impl ReactionChange {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ReactionChange::Unchanged)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub likes: u32,
    pub dislikes: u32,
    pub loves: u32,
    pub laughs: u32,
    pub wow: u32,
    pub sad: u32,
    pub angry: u32,
    pub insightful: u32,
}

impl ReactionSummary {
    pub fn add(&mut self, kind: ReactionKind, count: u32) {
        let slot = match kind {
            ReactionKind::Like => &mut self.likes,
            ReactionKind::Dislike => &mut self.dislikes,
            ReactionKind::Love => &mut self.loves,
            ReactionKind::Laugh => &mut self.laughs,
            ReactionKind::Wow => &mut self.wow,
            ReactionKind::Sad => &mut self.sad,
            ReactionKind::Angry => &mut self.angry,
            ReactionKind::Insightful => &mut self.insightful,
        };
        *slot += count;
    }

    pub fn total(&self) -> u32 {
        self.likes
            + self.dislikes
            + self.loves
            + self.laughs
            + self.wow
            + self.sad
            + self.angry
            + self.insightful
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub user_id: UserId,
    pub post_id: PostId,
    pub reason: ReportReason,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaction_kind_parsing() {
        assert_eq!("LOVE".parse::<ReactionKind>().unwrap(), ReactionKind::Love);
        assert_eq!("dislike".parse::<ReactionKind>().unwrap(), ReactionKind::Dislike);
        assert!("SHRUG".parse::<ReactionKind>().is_err());
        assert_eq!(ReactionKind::ALL.len(), 8);
        for kind in ReactionKind::ALL {
            assert_eq!(kind.as_str().parse::<ReactionKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn test_reaction_kind_serializes_uppercase() {
        let json = serde_json::to_string(&ReactionKind::Insightful).unwrap();
        assert_eq!(json, "\"INSIGHTFUL\"");
    }

    #[test]
    fn test_reaction_summary_counts() {
        let mut summary = ReactionSummary::default();
        summary.add(ReactionKind::Like, 3);
        summary.add(ReactionKind::Angry, 1);
        summary.add(ReactionKind::Like, 1);
        assert_eq!(summary.likes, 4);
        assert_eq!(summary.angry, 1);
        assert_eq!(summary.total(), 5);
    }

    #[test]
    fn test_unchanged_is_not_a_mutation() {
        assert!(ReactionChange::Created.is_mutation());
        assert!(ReactionChange::Deleted.is_mutation());
        assert!(!ReactionChange::Unchanged.is_mutation());
    }
}
