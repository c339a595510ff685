//! Exercise model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Remote collection that exercise records sync to
pub const EXERCISES_TABLE: &str = "exercises";

/// A unique identifier for an exercise, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExerciseId(Uuid);

impl ExerciseId {
    /// Create a new unique exercise ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ExerciseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExerciseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExerciseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A logged exercise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    /// Unique identifier
    pub id: ExerciseId,
    /// Exercise name, e.g. "Back squat"
    pub name: String,
    pub sets: u32,
    pub reps: u32,
    /// Working weight, absent for bodyweight movements
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms), compared by last-write-wins
    pub updated_at: i64,
    /// Soft delete flag for sync
    #[serde(default)]
    pub is_deleted: bool,
}

impl Exercise {
    /// Create a new exercise, validating its fields
    pub fn new(name: impl Into<String>, sets: u32, reps: u32) -> Result<Self> {
        let now = chrono::Utc::now().timestamp_millis();
        let exercise = Self {
            id: ExerciseId::new(),
            name: name.into().trim().to_string(),
            sets,
            reps,
            weight_kg: None,
            notes: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };
        exercise.validate()?;
        Ok(exercise)
    }

    #[must_use]
    pub const fn with_weight(mut self, weight_kg: Option<f64>) -> Self {
        self.weight_kg = weight_kg;
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = crate::util::normalize_text_option(notes);
        self
    }

    /// Check field constraints
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("exercise name cannot be empty".into()));
        }
        if self.sets == 0 || self.reps == 0 {
            return Err(Error::InvalidInput(
                "sets and reps must be greater than zero".into(),
            ));
        }
        if self.weight_kg.is_some_and(|weight| !weight.is_finite() || weight < 0.0) {
            return Err(Error::InvalidInput(
                "weight must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    /// Bump `updated_at`, keeping it monotonic even if the clock went backwards
    pub fn touch(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        self.updated_at = now.max(self.updated_at + 1);
    }

    /// Serialize into the opaque payload carried by sync operations
    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: &Value) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    /// One-line summary, e.g. "Back squat 5x5 @ 100kg"
    #[must_use]
    pub fn summary(&self) -> String {
        match self.weight_kg {
            Some(weight) => format!("{} {}x{} @ {weight}kg", self.name, self.sets, self.reps),
            None => format!("{} {}x{}", self.name, self.sets, self.reps),
        }
    }
}
