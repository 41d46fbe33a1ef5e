use core::str::FromStr;

use serde::{Deserialize, Serialize};

use pulse_core::DomainError;

/// Quota-tracked consumption category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ChatTokens,
    Images,
    VideoSeconds,
    CvExports,
    SlideExports,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::ChatTokens,
        ResourceKind::Images,
        ResourceKind::VideoSeconds,
        ResourceKind::CvExports,
        ResourceKind::SlideExports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ChatTokens => "chat_tokens",
            ResourceKind::Images => "images",
            ResourceKind::VideoSeconds => "video_seconds",
            ResourceKind::CvExports => "cv_exports",
            ResourceKind::SlideExports => "slide_exports",
        }
    }
}

impl core::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown resource kind: {s}")))
    }
}

/// One non-negative amount per resource kind.
///
/// Used both for plan limits and for live counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAmounts {
    pub chat_tokens: u64,
    pub images: u64,
    pub video_seconds: u64,
    pub cv_exports: u64,
    pub slide_exports: u64,
}

impl ResourceAmounts {
    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::ChatTokens => self.chat_tokens,
            ResourceKind::Images => self.images,
            ResourceKind::VideoSeconds => self.video_seconds,
            ResourceKind::CvExports => self.cv_exports,
            ResourceKind::SlideExports => self.slide_exports,
        }
    }

    pub fn get_mut(&mut self, kind: ResourceKind) -> &mut u64 {
        match kind {
            ResourceKind::ChatTokens => &mut self.chat_tokens,
            ResourceKind::Images => &mut self.images,
            ResourceKind::VideoSeconds => &mut self.video_seconds,
            ResourceKind::CvExports => &mut self.cv_exports,
            ResourceKind::SlideExports => &mut self.slide_exports,
        }
    }

    /// Builder used by tests and custom plans.
    pub fn with(mut self, kind: ResourceKind, amount: u64) -> Self {
        *self.get_mut(kind) = amount;
        self
    }
}

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Plus,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Plus => "plus",
            PlanTier::Pro => "pro",
        }
    }

    /// Per-period limits granted by the tier.
    pub fn limits(&self) -> ResourceAmounts {
        match self {
            PlanTier::Starter => ResourceAmounts {
                chat_tokens: 100_000,
                images: 50,
                video_seconds: 30,
                cv_exports: 5,
                slide_exports: 5,
            },
            PlanTier::Plus => ResourceAmounts {
                chat_tokens: 500_000,
                images: 200,
                video_seconds: 120,
                cv_exports: 20,
                slide_exports: 20,
            },
            PlanTier::Pro => ResourceAmounts {
                chat_tokens: 2_000_000,
                images: 1_000,
                video_seconds: 600,
                cv_exports: 100,
                slide_exports: 100,
            },
        }
    }
}

impl core::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starter" => Ok(PlanTier::Starter),
            "plus" => Ok(PlanTier::Plus),
            "pro" => Ok(PlanTier::Pro),
            other => Err(DomainError::validation(format!(
                "plan must be one of: starter, plus, pro (got {other})"
            ))),
        }
    }
}
