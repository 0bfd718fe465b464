use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{ConfigError, deserialize_duration};

/// One step of a ramp: move to `target` VUs over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Stage {
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    /// Parses `"<duration>:<target>"`, e.g. `1m:2` or `30s:10`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (duration, target) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidStage(s.to_string()))?;

        let duration = humantime::parse_duration(duration.trim())
            .map_err(|_| ConfigError::InvalidStage(s.to_string()))?;
        let target = target
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidStage(s.to_string()))?;

        Ok(Stage { duration, target })
    }
}

/// Parses a comma separated stage list such as `1m:2,1m:4,1m:1`.
pub fn parse_stages(s: &str) -> Result<Vec<Stage>, ConfigError> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(Stage::from_str)
        .collect()
}

pub fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new(Duration::from_secs(60), 2),
        Stage::new(Duration::from_secs(60), 4),
        Stage::new(Duration::from_secs(60), 1),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampPlan {
    start_vus: usize,
    stages: Vec<Stage>,
}

impl RampPlan {
    pub fn new(start_vus: usize, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        Ok(Self { start_vus, stages })
    }

    pub fn start_vus(&self) -> usize {
        self.start_vus
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    pub fn max_vus(&self) -> usize {
        self.stages
            .iter()
            .map(|stage| stage.target)
            .fold(self.start_vus, usize::max)
    }

    /// Target VU count `elapsed` into the run.
    ///
    /// Within a stage the count walks from the previous target towards the
    /// stage target one VU at a time, taking each step only once its share of
    /// the stage duration has passed.
    pub fn vus_at(&self, elapsed: Duration) -> usize {
        let mut from = self.start_vus;
        let mut offset = Duration::ZERO;

        for stage in &self.stages {
            let end = offset + stage.duration;
            if elapsed < end {
                return interpolate(from, stage.target, elapsed - offset, stage.duration);
            }
            from = stage.target;
            offset = end;
        }

        from
    }

    /// Index of the stage running at `elapsed`, `None` once the plan is over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut offset = Duration::ZERO;
        for (idx, stage) in self.stages.iter().enumerate() {
            offset += stage.duration;
            if elapsed < offset {
                return Some(idx);
            }
        }
        None
    }
}

// `span` is never zero here: a zero-length stage is skipped by the caller.
fn interpolate(from: usize, to: usize, into: Duration, span: Duration) -> usize {
    let steps = from.abs_diff(to) as u128;
    let taken = (steps * into.as_nanos() / span.as_nanos()) as usize;
    if to >= from { from + taken } else { from - taken }
}
