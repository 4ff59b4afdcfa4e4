use std::fmt::Display;

use thiserror::Error;

/// The shared output level of a group, in dB.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Level {
    value: f64,
}

/// The inclusive range a level may be set to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelBounds {
    lower: f64,
    upper: f64,
}

#[derive(Error, Debug, PartialEq)]
pub enum LevelError {
    #[error("Level is not a finite number.")]
    NotFinite,
    #[error("Invalid bounds: lower {lower} is above upper {upper}.")]
    InvertedBounds { lower: f64, upper: f64 },
}

impl Level {
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Move by `step` and clamp into `bounds`.
    pub fn stepped(self, step: f64, bounds: &LevelBounds) -> Level {
        Level {
            value: bounds.clamp(self.value + step),
        }
    }
}

impl TryFrom<f64> for Level {
    type Error = LevelError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() {
            return Err(LevelError::NotFinite);
        }
        Ok(Self { value })
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}dB", self.value)
    }
}

impl LevelBounds {
    pub fn new(lower: f64, upper: f64) -> Result<Self, LevelError> {
        if !lower.is_finite() || !upper.is_finite() {
            return Err(LevelError::NotFinite);
        }
        if lower > upper {
            return Err(LevelError::InvertedBounds { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    // NOTE: bounds are validated finite and ordered, so `f64::clamp` cannot panic.
    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }
}

impl Default for LevelBounds {
    fn default() -> Self {
        Self {
            lower: 0f64,
            upper: 90f64,
        }
    }
}
