//! Allocation Data Model
//!
//! Strongly typed counselling allocation facts. Rows coming out of any store are
//! converted into [`AllocationRecord`] through [`RawAllocationRow::validate`], so the
//! analysis code never sees a half-populated seat or an unparsed status string.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Counselling round. Numbered rounds sort by number; mop-up sorts after all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Round(u16);

impl Round {
    /// Terminal mop-up round marker.
    pub const MOP_UP: Round = Round(100);

    pub fn new(number: u16) -> Option<Self> {
        if number == 0 || number >= Self::MOP_UP.0 {
            None
        } else {
            Some(Self(number))
        }
    }

    pub fn number(&self) -> u16 {
        self.0
    }

    pub fn is_mop_up(&self) -> bool {
        *self == Self::MOP_UP
    }

    /// The round that follows this one. Mop-up is terminal.
    pub fn next(&self) -> Option<Round> {
        if self.is_mop_up() {
            None
        } else {
            Some(Round(self.0 + 1))
        }
    }

    /// Raw value as stored in the `round` column.
    pub fn as_db(&self) -> i64 {
        self.0 as i64
    }

    pub fn from_db(value: i64) -> Option<Self> {
        if value == Self::MOP_UP.0 as i64 {
            Some(Self::MOP_UP)
        } else {
            u16::try_from(value).ok().and_then(Self::new)
        }
    }
}

impl TryFrom<u16> for Round {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_db(value as i64).ok_or_else(|| format!("invalid round {}", value))
    }
}

impl From<Round> for u16 {
    fn from(round: Round) -> Self {
        round.0
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_mop_up() {
            write!(f, "Mop-up")
        } else {
            write!(f, "Round {}", self.0)
        }
    }
}

impl FromStr for Round {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = normalize_token(s);
        if matches!(norm.as_str(), "MOP_UP" | "MOPUP" | "MOP") {
            return Ok(Self::MOP_UP);
        }
        let digits = norm.trim_start_matches("ROUND").trim_start_matches('_');
        digits
            .parse::<i64>()
            .ok()
            .and_then(Self::from_db)
            .ok_or_else(|| format!("invalid round '{}'", s))
    }
}

/// Allocation status of one rank in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    Allotted,
    Upgraded,
    Freeze,
    Withdrawn,
    NotAllotted,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Allotted => "ALLOTTED",
            AllocationStatus::Upgraded => "UPGRADED",
            AllocationStatus::Freeze => "FREEZE",
            AllocationStatus::Withdrawn => "WITHDRAWN",
            AllocationStatus::NotAllotted => "NOT_ALLOTTED",
        }
    }

    /// Whether a record with this status must carry a seat.
    pub fn holds_seat(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Allotted | AllocationStatus::Upgraded | AllocationStatus::Freeze
        )
    }
}

impl FromStr for AllocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "ALLOTTED" => Ok(Self::Allotted),
            "UPGRADED" => Ok(Self::Upgraded),
            "FREEZE" | "FROZEN" => Ok(Self::Freeze),
            "WITHDRAWN" => Ok(Self::Withdrawn),
            "NOT_ALLOTTED" => Ok(Self::NotAllotted),
            _ => Err(format!("invalid allocation status '{}'", s)),
        }
    }
}

/// Kind of move between two rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeType {
    College,
    Course,
    Quota,
    State,
    Combo,
    None,
}

impl UpgradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeType::College => "COLLEGE",
            UpgradeType::Course => "COURSE",
            UpgradeType::Quota => "QUOTA",
            UpgradeType::State => "STATE",
            UpgradeType::Combo => "COMBO",
            UpgradeType::None => "NONE",
        }
    }

    pub fn is_move(&self) -> bool {
        *self != UpgradeType::None
    }
}

impl FromStr for UpgradeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "COLLEGE" => Ok(Self::College),
            "COURSE" => Ok(Self::Course),
            "QUOTA" => Ok(Self::Quota),
            "STATE" => Ok(Self::State),
            "COMBO" => Ok(Self::Combo),
            "NONE" | "" => Ok(Self::None),
            _ => Err(format!("invalid upgrade type '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    #[default]
    Unverified,
    Verified,
    Disputed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "UNVERIFIED",
            VerificationStatus::Verified => "VERIFIED",
            VerificationStatus::Disputed => "DISPUTED",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "UNVERIFIED" | "PENDING" | "" => Ok(Self::Unverified),
            "VERIFIED" => Ok(Self::Verified),
            "DISPUTED" => Ok(Self::Disputed),
            _ => Err(format!("invalid verification status '{}'", s)),
        }
    }
}

/// A (college, course) pair: one seat type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeatKey {
    pub college_id: String,
    pub course_id: String,
}

impl SeatKey {
    pub fn new(college_id: impl Into<String>, course_id: impl Into<String>) -> Self {
        Self {
            college_id: college_id.into(),
            course_id: course_id.into(),
        }
    }
}

impl fmt::Display for SeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.college_id, self.course_id)
    }
}

/// Identity of one applicant inside a partition. Ranks are only unique per category+quota.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RankIdentity {
    pub rank: u32,
    pub category: String,
    pub quota: String,
}

/// Primary key of one allocation fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub year: u16,
    pub source_id: String,
    pub level_id: String,
    pub category: String,
    pub quota: String,
    pub rank: u32,
    pub round: Round,
}

impl RecordKey {
    /// Stable textual form, used to derive deterministic record ids.
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.year,
            self.source_id,
            self.level_id,
            self.category,
            self.quota,
            self.rank,
            self.round.as_db()
        )
    }
}

/// One allocation fact: a rank in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub rank: u32,
    pub year: u16,
    pub category: String,
    pub quota: String,
    pub round: Round,
    pub source_id: String,
    pub level_id: String,
    pub seat: Option<SeatKey>,
    pub allocation_status: AllocationStatus,
    pub is_upgrade: bool,
    pub previous_seat: Option<SeatKey>,
    pub upgrade_type: UpgradeType,
    pub data_source: String,
    pub verification_status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub college_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl AllocationRecord {
    pub fn identity(&self) -> RankIdentity {
        RankIdentity {
            rank: self.rank,
            category: self.category.clone(),
            quota: self.quota.clone(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            year: self.year,
            source_id: self.source_id.clone(),
            level_id: self.level_id.clone(),
            category: self.category.clone(),
            quota: self.quota.clone(),
            rank: self.rank,
            round: self.round,
        }
    }

    pub fn is_allotted(&self) -> bool {
        self.seat.is_some()
    }

    pub fn college_id(&self) -> Option<&str> {
        self.seat.as_ref().map(|s| s.college_id.as_str())
    }

    pub fn course_id(&self) -> Option<&str> {
        self.seat.as_ref().map(|s| s.course_id.as_str())
    }

    /// Check the per-row invariants. Cross-round continuity is checked by the journey fold.
    pub fn validate(&self) -> Result<(), StoreError> {
        let malformed = |field: &str, reason: String| StoreError::MalformedRow {
            field: field.to_string(),
            reason,
        };

        if self.rank == 0 {
            return Err(malformed("rank", "rank must be >= 1".into()));
        }
        if let Some(seat) = &self.seat {
            if seat.college_id.is_empty() || seat.course_id.is_empty() {
                return Err(malformed("college_id", "seat ids must be non-empty".into()));
            }
        }
        match (self.allocation_status.holds_seat(), self.seat.is_some()) {
            (true, false) => {
                return Err(malformed(
                    "allocation_status",
                    format!("{} requires a seat", self.allocation_status.as_str()),
                ))
            }
            (false, true) => {
                return Err(malformed(
                    "allocation_status",
                    format!("{} must not carry a seat", self.allocation_status.as_str()),
                ))
            }
            _ => {}
        }
        if self.is_upgrade {
            let Some(previous) = &self.previous_seat else {
                return Err(malformed(
                    "previous_college_id",
                    "upgrade without a previous seat".into(),
                ));
            };
            if self.seat.is_none() {
                return Err(malformed("college_id", "upgrade without a destination seat".into()));
            }
            if self.seat.as_ref() == Some(previous) {
                return Err(malformed(
                    "previous_college_id",
                    "upgrade to the same seat".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Untyped row shape as it arrives from SQL columns or JSON import lines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAllocationRow {
    pub rank: i64,
    pub year: i64,
    pub category: String,
    pub quota: String,
    #[serde(deserialize_with = "deserialize_round_token")]
    pub round: String,
    pub source_id: String,
    pub level_id: String,
    #[serde(default)]
    pub college_id: Option<String>,
    #[serde(default)]
    pub course_id: Option<String>,
    pub allocation_status: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_upgrade: bool,
    #[serde(default)]
    pub previous_college_id: Option<String>,
    #[serde(default)]
    pub previous_course_id: Option<String>,
    #[serde(default)]
    pub upgrade_type: Option<String>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub verification_status: Option<String>,
    #[serde(default)]
    pub college_name: Option<String>,
    #[serde(default)]
    pub course_name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Round as exported: `"2"`, `"MOP_UP"` or a bare number.
fn deserialize_round_token<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => Ok(s),
        StringOrNumber::Number(n) => Ok(n.to_string()),
    }
}

/// Boolean flag that may come as `true`/`false` or `0`/`1`.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrNumber {
        Bool(bool),
        Number(i64),
    }

    match BoolOrNumber::deserialize(deserializer)? {
        BoolOrNumber::Bool(b) => Ok(b),
        BoolOrNumber::Number(0) => Ok(false),
        BoolOrNumber::Number(1) => Ok(true),
        BoolOrNumber::Number(n) => Err(serde::de::Error::custom(format!(
            "expected 0 or 1, got {}",
            n
        ))),
    }
}

impl RawAllocationRow {
    /// Convert into a typed record, rejecting anything ambiguous.
    pub fn validate(self) -> Result<AllocationRecord, StoreError> {
        let malformed = |field: &str, reason: String| StoreError::MalformedRow {
            field: field.to_string(),
            reason,
        };

        let rank = u32::try_from(self.rank)
            .map_err(|_| malformed("rank", format!("out of range: {}", self.rank)))?;
        let year = u16::try_from(self.year)
            .ok()
            .filter(|y| (1950..=2200).contains(y))
            .ok_or_else(|| malformed("year", format!("out of range: {}", self.year)))?;
        let round: Round = self.round.parse().map_err(|e| malformed("round", e))?;
        let allocation_status: AllocationStatus = self
            .allocation_status
            .parse()
            .map_err(|e| malformed("allocation_status", e))?;
        let upgrade_type: UpgradeType = self
            .upgrade_type
            .as_deref()
            .unwrap_or("NONE")
            .parse()
            .map_err(|e| malformed("upgrade_type", e))?;
        let verification_status: VerificationStatus = self
            .verification_status
            .as_deref()
            .unwrap_or("")
            .parse()
            .map_err(|e| malformed("verification_status", e))?;

        for (field, value) in [
            ("category", &self.category),
            ("quota", &self.quota),
            ("source_id", &self.source_id),
            ("level_id", &self.level_id),
        ] {
            if value.trim().is_empty() {
                return Err(malformed(field, "must be non-empty".into()));
            }
        }

        let seat = pair_to_seat("college_id", self.college_id, self.course_id)?;
        let previous_seat = pair_to_seat(
            "previous_college_id",
            self.previous_college_id,
            self.previous_course_id,
        )?;

        let record = AllocationRecord {
            rank,
            year,
            category: self.category,
            quota: self.quota,
            round,
            source_id: self.source_id,
            level_id: self.level_id,
            seat,
            allocation_status,
            is_upgrade: self.is_upgrade,
            previous_seat,
            upgrade_type,
            data_source: self.data_source.unwrap_or_else(|| "unknown".to_string()),
            verification_status,
            college_name: self.college_name,
            course_name: self.course_name,
            state: self.state,
        };
        record.validate()?;
        Ok(record)
    }
}

impl From<&AllocationRecord> for RawAllocationRow {
    fn from(r: &AllocationRecord) -> Self {
        Self {
            rank: r.rank as i64,
            year: r.year as i64,
            category: r.category.clone(),
            quota: r.quota.clone(),
            round: r.round.as_db().to_string(),
            source_id: r.source_id.clone(),
            level_id: r.level_id.clone(),
            college_id: r.college_id().map(str::to_string),
            course_id: r.course_id().map(str::to_string),
            allocation_status: r.allocation_status.as_str().to_string(),
            is_upgrade: r.is_upgrade,
            previous_college_id: r.previous_seat.as_ref().map(|s| s.college_id.clone()),
            previous_course_id: r.previous_seat.as_ref().map(|s| s.course_id.clone()),
            upgrade_type: Some(r.upgrade_type.as_str().to_string()),
            data_source: Some(r.data_source.clone()),
            verification_status: Some(r.verification_status.as_str().to_string()),
            college_name: r.college_name.clone(),
            course_name: r.course_name.clone(),
            state: r.state.clone(),
        }
    }
}

fn pair_to_seat(
    field: &str,
    college: Option<String>,
    course: Option<String>,
) -> Result<Option<SeatKey>, StoreError> {
    let college = college.filter(|s| !s.trim().is_empty());
    let course = course.filter(|s| !s.trim().is_empty());
    match (college, course) {
        (Some(college_id), Some(course_id)) => Ok(Some(SeatKey {
            college_id,
            course_id,
        })),
        (None, None) => Ok(None),
        _ => Err(StoreError::MalformedRow {
            field: field.to_string(),
            reason: "college and course must both be present or both absent".into(),
        }),
    }
}

fn normalize_token(s: &str) -> String {
    s.trim().to_uppercase().replace(['-', ' '], "_")
}
