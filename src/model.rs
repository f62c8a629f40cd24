use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Id = i64;

#[derive(Debug, Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// ── Directory ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Marketplace {
    pub id: Id,
    pub name: String,
    /// Only the hostname matters; see `resolve::marketplace`.
    pub base_url: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: Id,
    pub name: String,
    pub sku: String,
    pub min_price: Decimal,
    pub active: bool,
}

// ── Status enums ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComplianceStatus {
    Compliant,
    BelowMinimum,
}

impl ComplianceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::BelowMinimum => "below-minimum",
        }
    }
}

impl FromStr for ComplianceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compliant" => Ok(Self::Compliant),
            "below-minimum" => Ok(Self::BelowMinimum),
            other => Err(UnknownVariant {
                kind: "compliance status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    ComplaintConverted,
    Manual,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ComplaintConverted => "complaint-converted",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for Origin {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complaint-converted" => Ok(Self::ComplaintConverted),
            "manual" => Ok(Self::Manual),
            other => Err(UnknownVariant {
                kind: "origin",
                value: other.to_string(),
            }),
        }
    }
}

/// Complaint lifecycle. Rejection is recorded through the admin comment,
/// not as a separate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComplaintStatus {
    Requested,
    InProgress,
    Resolved,
}

impl ComplaintStatus {
    pub const OPEN: [ComplaintStatus; 2] = [Self::Requested, Self::InProgress];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::InProgress => "in-progress",
            Self::Resolved => "resolved",
        }
    }

    pub fn is_open(self) -> bool {
        Self::OPEN.contains(&self)
    }
}

impl FromStr for ComplaintStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "in-progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            other => Err(UnknownVariant {
                kind: "complaint status",
                value: other.to_string(),
            }),
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        })*
    };
}

display_as_str!(ComplianceStatus, Origin, ComplaintStatus);

// ── Records ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoredListing {
    pub id: Id,
    pub url: String,
    /// Older or hand-entered rows may lack a code.
    pub code: Option<String>,
    pub product_id: Id,
    pub marketplace_id: Id,
    /// `None` for admin-entered listings.
    pub client_id: Option<Id>,
    pub detected_price: Decimal,
    pub min_price: Decimal,
    pub status: ComplianceStatus,
    pub origin: Origin,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewListing {
    pub url: String,
    pub code: Option<String>,
    pub product_id: Id,
    pub marketplace_id: Id,
    pub client_id: Option<Id>,
    pub detected_price: Decimal,
    pub min_price: Decimal,
    pub status: ComplianceStatus,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Complaint {
    pub id: Id,
    pub client_id: Id,
    pub product_id: Id,
    pub marketplace_id: Id,
    pub url: String,
    pub reported_price: Decimal,
    pub notes: Option<String>,
    pub status: ComplaintStatus,
    pub admin_comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewComplaint {
    pub client_id: Id,
    pub product_id: Id,
    pub marketplace_id: Id,
    pub url: String,
    pub reported_price: Decimal,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complaint_status_round_trips_through_text() {
        for status in [
            ComplaintStatus::Requested,
            ComplaintStatus::InProgress,
            ComplaintStatus::Resolved,
        ] {
            assert_eq!(status.as_str().parse::<ComplaintStatus>().unwrap(), status);
        }
    }

    #[test]
    fn only_requested_and_in_progress_are_open() {
        assert!(ComplaintStatus::Requested.is_open());
        assert!(ComplaintStatus::InProgress.is_open());
        assert!(!ComplaintStatus::Resolved.is_open());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "rejected".parse::<ComplaintStatus>().unwrap_err();
        assert_eq!(err.value, "rejected");
        assert!("below_minimum".parse::<ComplianceStatus>().is_err());
    }
}
