//! Shared types for the doorway occupancy pipeline

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Format epoch milliseconds as an RFC 3339 UTC timestamp
pub fn iso_timestamp(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// State of the paired A/B beam sensors at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub sensor_a_active: bool,
    pub sensor_b_active: bool,
    /// Read time (epoch ms)
    pub timestamp_ms: u64,
}

/// One environmental reading: PIR motion, sound level and CO2
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentSample {
    pub motion_active: bool,
    pub sound_level_db: f64,
    pub co2_ppm: f64,
    /// Read time (epoch ms)
    pub timestamp_ms: u64,
}

/// A parsed sensor line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Sensor(SensorSample),
    Environment(EnvironmentSample),
}

impl Reading {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Reading::Sensor(s) => s.timestamp_ms,
            Reading::Environment(e) => e.timestamp_ms,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Reading::Sensor(_) => "dual",
            Reading::Environment(_) => "environment",
        }
    }
}

/// Which line kinds a doorway's source is expected to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorMode {
    /// A/B beam pair only
    Dual,
    /// Motion/sound/CO2 only
    Environment,
    /// Both kinds interleaved on one stream
    Combined,
}

impl SensorMode {
    /// Whether a reading of this kind should be routed for this mode
    #[inline]
    pub fn accepts(&self, reading: &Reading) -> bool {
        matches!(
            (self, reading),
            (SensorMode::Combined, _)
                | (SensorMode::Dual, Reading::Sensor(_))
                | (SensorMode::Environment, Reading::Environment(_))
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorMode::Dual => "dual",
            SensorMode::Environment => "environment",
            SensorMode::Combined => "combined",
        }
    }
}

/// Direction of a doorway crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrossingKind {
    #[serde(rename = "ENTER")]
    Enter,
    #[serde(rename = "EXIT")]
    Exit,
}

impl CrossingKind {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossingKind::Enter => "ENTER",
            CrossingKind::Exit => "EXIT",
        }
    }
}

/// A directional crossing emitted by the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossingEvent {
    pub kind: CrossingKind,
    /// Time of the sample that completed the crossing (epoch ms)
    pub timestamp_ms: u64,
    /// Occupancy count after applying this event
    pub resulting_count: u32,
}

/// Rate/average features reduced from the rolling window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatedFeatures {
    /// Fraction of buffered motion samples that were active
    pub motion_rate: f64,
    pub avg_sound: f64,
    pub avg_co2: f64,
    pub timestamp_ms: u64,
}

/// Coarse band for a crowdiness index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrowdLevel {
    Low,
    Moderate,
    High,
}

impl CrowdLevel {
    /// Band boundaries: < 0.3 low, < 0.6 moderate, otherwise high
    pub fn from_index(index: f64) -> Self {
        if index < 0.3 {
            CrowdLevel::Low
        } else if index < 0.6 {
            CrowdLevel::Moderate
        } else {
            CrowdLevel::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrowdLevel::Low => "low",
            CrowdLevel::Moderate => "moderate",
            CrowdLevel::High => "high",
        }
    }
}

/// Scored occupancy for one aggregation tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccupancySnapshot {
    /// Normalized crowdiness in [0, 1]
    pub crowdiness_index: f64,
    pub motion_rate: f64,
    pub avg_sound: f64,
    pub avg_co2: f64,
    pub timestamp_ms: u64,
    pub level: CrowdLevel,
}

impl OccupancySnapshot {
    pub fn new(features: &AggregatedFeatures, crowdiness_index: f64) -> Self {
        Self {
            crowdiness_index,
            motion_rate: features.motion_rate,
            avg_sound: features.avg_sound,
            avg_co2: features.avg_co2,
            timestamp_ms: features.timestamp_ms,
            level: CrowdLevel::from_index(crowdiness_index),
        }
    }
}
