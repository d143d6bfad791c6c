//! Identifier types and research ids.
//!
//! `IdentifierType` is the closed set of identifier kinds that can appear in a
//! data set. Linking types have a column in the identity map and are replaced
//! by a research id when scrubbed. Confidential types (`Email`, `Name`,
//! `Other`) never reach the identity map; their values are dropped.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Suffix appended to an identifying column name in scrubbed output.
pub const RESEARCH_ID_SUFFIX: &str = "_research_id";

static INSTITUTIONAL_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{8}$").unwrap());
static GUEST_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z]\w{7}$").unwrap());
static EPPN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+$").unwrap());
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[_A-Za-z0-9+\-]+(\.[_A-Za-z0-9\-]+)*@[A-Za-z0-9\-]+(\.[A-Za-z0-9]+)*(\.[A-Za-z]{2,})$",
    )
    .unwrap()
});
static RESEARCH_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[a-f0-9]{8}-[a-f0-9]{4}-4[a-f0-9]{3}-[89ab][a-f0-9]{3}-[a-f0-9]{12}$")
        .unwrap()
});

/// Kinds of real-world identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdentifierType {
    /// Main identifier of the source data set.
    #[serde(alias = "dataset_id")]
    DatasetId,
    /// Account id on the source platform.
    #[serde(alias = "platform_id")]
    PlatformId,
    /// Eight-digit institutional id.
    #[serde(alias = "institutional_id")]
    InstitutionalId,
    /// Secondary id issued to guests and affiliates.
    #[serde(alias = "guest_id")]
    GuestId,
    /// Principal name (`user@realm`).
    #[serde(alias = "eppn")]
    Eppn,
    #[serde(alias = "email")]
    Email,
    #[serde(alias = "name")]
    Name,
    /// Confidential value with no linking role.
    #[serde(alias = "other")]
    Other,
}

/// Value check used to disambiguate multiplexed columns.
#[derive(Debug, Clone, Copy)]
pub enum Validator {
    /// Signed 64-bit integer, canonicalised to its decimal form.
    Integer,
    /// Full-match regular expression.
    Pattern(&'static Regex),
    /// Accepts anything non-empty.
    Any,
}

impl Validator {
    /// Return the canonical form of `value` if it is acceptable.
    pub fn accept(&self, value: &str) -> Option<String> {
        match self {
            Validator::Integer => value.parse::<i64>().ok().map(|n| n.to_string()),
            Validator::Pattern(re) => re.is_match(value).then(|| value.to_string()),
            Validator::Any => Some(value.to_string()),
        }
    }
}

impl IdentifierType {
    pub fn all() -> &'static [IdentifierType] {
        &[
            Self::DatasetId,
            Self::PlatformId,
            Self::InstitutionalId,
            Self::GuestId,
            Self::Eppn,
            Self::Email,
            Self::Name,
            Self::Other,
        ]
    }

    /// Types stored in the identity map, in column order.
    pub fn linking() -> &'static [IdentifierType] {
        &[
            Self::DatasetId,
            Self::PlatformId,
            Self::InstitutionalId,
            Self::GuestId,
            Self::Eppn,
        ]
    }

    /// Column name used for this type in the identity map.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::DatasetId => "dataset_id",
            Self::PlatformId => "platform_id",
            Self::InstitutionalId => "institutional_id",
            Self::GuestId => "guest_id",
            Self::Eppn => "eppn",
            Self::Email => "email",
            Self::Name => "name",
            Self::Other => "other",
        }
    }

    pub fn is_linking(&self) -> bool {
        !matches!(self, Self::Email | Self::Name | Self::Other)
    }

    /// True for types whose validator accepts any value.
    pub fn is_catch_all(&self) -> bool {
        matches!(self.validator(), Validator::Any)
    }

    pub fn validator(&self) -> Validator {
        match self {
            Self::DatasetId | Self::PlatformId => Validator::Integer,
            Self::InstitutionalId => Validator::Pattern(&INSTITUTIONAL_ID_RE),
            Self::GuestId => Validator::Pattern(&GUEST_ID_RE),
            Self::Eppn => Validator::Pattern(&EPPN_RE),
            Self::Email => Validator::Pattern(&EMAIL_RE),
            Self::Name | Self::Other => Validator::Any,
        }
    }

    /// Trim and validate a raw value. `None` if blank or rejected.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        self.validator().accept(trimmed)
    }

    /// Name of the scrubbed-output column replacing `column`, if this type
    /// is substituted rather than dropped.
    pub fn output_column(&self, column: &str) -> Option<String> {
        self.is_linking()
            .then(|| format!("{}{}", column, RESEARCH_ID_SUFFIX))
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

impl FromStr for IdentifierType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|t| t.field_name() == s || format!("{:?}", t) == s)
            .ok_or_else(|| Error::Schema(format!("Unknown identifier type: {}", s)))
    }
}

/// Pseudonym substituted for every identifier of one individual.
///
/// Always a random version-4 UUID in lowercase hyphenated form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResearchId(String);

impl ResearchId {
    /// Allocate a fresh research id from the OS random source.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(s: &str) -> Result<Self> {
        if RESEARCH_ID_RE.is_match(s) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(Error::Schema(format!("Malformed research id: {:?}", s)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResearchId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ResearchId> for String {
    fn from(id: ResearchId) -> Self {
        id.0
    }
}
