//! Core types for popgen

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Run identifier, taken from the name of the generator's output directory.
///
/// Always a single path component: it is joined onto the output root to find
/// raw directories and archives, so separators and `..` are rejected.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || s.len() > 255 {
            return Err(Error::InvalidRunId(s));
        }
        if s == "." || s == ".." || s.contains(['/', '\\', '\0']) {
            return Err(Error::InvalidRunId(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Output representation emitted by the generator.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Tabular output, always produced.
    Csv,
    /// Structured-document output.
    Fhir,
}

impl Format {
    pub const ALL: [Format; 2] = [Format::Csv, Format::Fhir];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Fhir => "fhir",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Format::Csv),
            "fhir" => Ok(Format::Fhir),
            _ => Err(Error::UnknownFormat(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M", alias = "MALE")]
    Male,
    #[serde(rename = "F", alias = "FEMALE")]
    Female,
}

impl Gender {
    /// Value passed to the generator's gender flag.
    pub fn flag_value(&self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
        }
    }
}

impl FromStr for Gender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M" | "MALE" => Ok(Gender::Male),
            "F" | "FEMALE" => Ok(Gender::Female),
            _ => Err(Error::validation(format!("unrecognized gender '{}'", s))),
        }
    }
}

/// Inclusive age range. Only constructible with `min <= max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    min: u32,
    max: u32,
}

impl AgeRange {
    pub fn new(min: u32, max: u32) -> Result<Self> {
        if min > max {
            return Err(Error::validation(format!(
                "minAge ({}) must not exceed maxAge ({})",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

impl std::fmt::Display for AgeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// A state, optionally narrowed to a city within it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    city: Option<String>,
}

impl Location {
    /// Build a location from raw inputs. Without a non-empty state there is no
    /// location at all, and a city given alone is dropped.
    pub fn new(state: Option<&str>, city: Option<&str>) -> Option<Self> {
        let state = state.map(str::trim).filter(|s| !s.is_empty())?;
        let city = city
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from);
        Some(Self {
            state: state.to_string(),
            city,
        })
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn city(&self) -> Option<&str> {
        self.city.as_deref()
    }
}

/// Validated generation parameters. Every absent field means "generator default".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_range: Option<AgeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Generation request as received from a caller, before validation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationRequest {
    pub population_size: Option<i64>,
    pub gender: Option<String>,
    pub min_age: Option<i64>,
    pub max_age: Option<i64>,
    pub state: Option<String>,
    pub city: Option<String>,
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<GenerationParameters> {
        let population_size = match self.population_size {
            None => None,
            Some(n) if n <= 0 => {
                return Err(Error::validation(format!(
                    "populationSize must be positive, got {}",
                    n
                )))
            }
            Some(n) => Some(u32::try_from(n).map_err(|_| {
                Error::validation(format!("populationSize {} is too large", n))
            })?),
        };

        let gender = match self.gender.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(g) => Some(g.parse::<Gender>()?),
        };

        let age_range = match (self.min_age, self.max_age) {
            (None, None) => None,
            (Some(min), Some(max)) => Some(AgeRange::new(age(min, "minAge")?, age(max, "maxAge")?)?),
            _ => {
                return Err(Error::validation(
                    "minAge and maxAge must be given together",
                ))
            }
        };

        Ok(GenerationParameters {
            population_size,
            gender,
            age_range,
            location: Location::new(self.state.as_deref(), self.city.as_deref()),
        })
    }
}

fn age(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::validation(format!("{} must be a non-negative age, got {}", field, value)))
}

/// Caller role as resolved by the identity provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// An authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

impl Identity {
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        Self {
            username: username.into(),
            role,
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.role == Role::Admin
    }

    /// Whether this caller may act on a run owned by `owner`.
    pub fn can_manage(&self, owner: &str) -> bool {
        self.is_elevated() || self.username == owner
    }
}

/// Persisted record of one completed generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: RunId,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parameters: GenerationParameters,
}

impl Run {
    pub fn new(run_id: RunId, owner: impl Into<String>, parameters: GenerationParameters) -> Self {
        Self {
            run_id,
            owner: owner.into(),
            created_at: Utc::now(),
            parameters,
        }
    }
}
