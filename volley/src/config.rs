//! Load profile configuration.
//!
//! A [`LoadProfile`] is an ordered list of [`ExecutorConfig`]s. It is plain data: it can be
//! deserialized from JSON (durations are human readable, e.g. `"1m30s"`) or assembled with
//! [`ExecutorConfig::builder`]. [`LoadProfile::validate`] turns it into a [`Plan`] with
//! absolute start offsets and the worker ceiling the run will be held to.
use std::{collections::BTreeMap, collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::ConfigError,
    stage::{RampSequencer, Stage},
};

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACEFUL_RAMP_DOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);
pub const DEFAULT_TIME_UNIT: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Ordered set of executors making up one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadProfile {
    pub executors: Vec<ExecutorConfig>,
    /// Global worker ceiling. Defaults to the peak the profile needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// How long a cancelled run waits for executors to unwind.
    #[serde(default = "default_shutdown_timeout", with = "duration_format")]
    pub shutdown_timeout: Duration,
}

/// One executor of a [`LoadProfile`]. Immutable once validated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct ExecutorConfig {
    #[builder(setter(into))]
    pub name: String,
    #[serde(flatten)]
    pub kind: ExecutorKind,
    /// Explicit offset from the start of the run. When absent the executor starts right
    /// after the previous one finishes its main phase, which requires that phase to have
    /// an end.
    #[builder(default, setter(strip_option))]
    #[serde(
        default,
        with = "option_duration_format",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<Duration>,
    #[builder(default = DEFAULT_GRACEFUL_STOP)]
    #[serde(default = "default_graceful_stop", with = "duration_format")]
    pub graceful_stop: Duration,
    /// Extra tags attached to every sample this executor produces.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// A fixed number of workers looping iterations for `duration`.
    ConstantVus {
        #[serde(default = "one")]
        vus: usize,
        #[serde(with = "duration_format")]
        duration: Duration,
    },
    /// Worker count follows `stages`, starting from `start_vus`.
    RampingVus {
        #[serde(default = "one")]
        start_vus: usize,
        stages: Vec<Stage>,
        #[serde(default = "default_graceful_ramp_down", with = "duration_format")]
        graceful_ramp_down: Duration,
    },
    /// Every worker runs exactly `iterations` iterations.
    PerVuIterations {
        #[serde(default = "one")]
        vus: usize,
        #[serde(default = "one_u64")]
        iterations: u64,
        #[serde(default = "default_max_duration", with = "duration_format")]
        max_duration: Duration,
    },
    /// Workers share a budget of `iterations` iterations.
    SharedIterations {
        #[serde(default = "one")]
        vus: usize,
        #[serde(default = "one_u64")]
        iterations: u64,
        #[serde(default = "default_max_duration", with = "duration_format")]
        max_duration: Duration,
    },
    /// `rate` iterations started every `time_unit`.
    ConstantArrivalRate {
        rate: f64,
        #[serde(default = "default_time_unit", with = "duration_format")]
        time_unit: Duration,
        #[serde(with = "duration_format")]
        duration: Duration,
        pre_allocated_vus: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_vus: Option<usize>,
    },
    /// Iterations started every `time_unit` follows `stages`, starting from `start_rate`.
    RampingArrivalRate {
        #[serde(default)]
        start_rate: f64,
        #[serde(default = "default_time_unit", with = "duration_format")]
        time_unit: Duration,
        stages: Vec<Stage>,
        pre_allocated_vus: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_vus: Option<usize>,
    },
    /// Worker count is set at run time through an
    /// [`ExternalController`](crate::executor::ExternalController).
    ExternallyControlled {
        #[serde(default = "one")]
        vus: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_vus: Option<usize>,
        /// `0s` runs until stopped.
        #[serde(with = "duration_format")]
        duration: Duration,
    },
}

impl ExecutorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConstantVus { .. } => "constant-vus",
            Self::RampingVus { .. } => "ramping-vus",
            Self::PerVuIterations { .. } => "per-vu-iterations",
            Self::SharedIterations { .. } => "shared-iterations",
            Self::ConstantArrivalRate { .. } => "constant-arrival-rate",
            Self::RampingArrivalRate { .. } => "ramping-arrival-rate",
            Self::ExternallyControlled { .. } => "externally-controlled",
        }
    }

    /// Length of the main phase, graceful stop excluded.
    pub fn planned_duration(&self) -> Duration {
        match self {
            Self::ConstantVus { duration, .. }
            | Self::ConstantArrivalRate { duration, .. }
            | Self::ExternallyControlled { duration, .. } => *duration,
            Self::RampingVus { stages, .. } | Self::RampingArrivalRate { stages, .. } => {
                stages.iter().map(|s| s.duration).sum()
            }
            Self::PerVuIterations { max_duration, .. }
            | Self::SharedIterations { max_duration, .. } => *max_duration,
        }
    }

    /// Most workers this executor can hold at once.
    pub fn max_workers(&self) -> usize {
        match self {
            Self::ConstantVus { vus, .. }
            | Self::PerVuIterations { vus, .. }
            | Self::SharedIterations { vus, .. } => *vus,
            Self::RampingVus {
                start_vus, stages, ..
            } => vus_for(RampSequencer::new(*start_vus as f64, stages).peak()),
            Self::ConstantArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            }
            | Self::RampingArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            } => max_vus.unwrap_or(*pre_allocated_vus).max(*pre_allocated_vus),
            Self::ExternallyControlled { vus, max_vus, .. } => max_vus.unwrap_or(*vus).max(*vus),
        }
    }

    /// Workers the executor takes as soon as it starts.
    pub fn initial_workers(&self) -> usize {
        match self {
            Self::ConstantVus { vus, .. }
            | Self::PerVuIterations { vus, .. }
            | Self::SharedIterations { vus, .. }
            | Self::ExternallyControlled { vus, .. } => *vus,
            Self::RampingVus { start_vus, .. } => *start_vus,
            Self::ConstantArrivalRate {
                pre_allocated_vus, ..
            }
            | Self::RampingArrivalRate {
                pre_allocated_vus, ..
            } => *pre_allocated_vus,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::invalid(name, reason));
        match self {
            Self::ConstantVus { vus, duration } => {
                if *vus == 0 {
                    return invalid("vus must be greater than 0");
                }
                if duration.is_zero() {
                    return invalid("duration must be greater than 0");
                }
            }
            Self::RampingVus { stages, .. } => validate_stages(name, stages)?,
            Self::PerVuIterations {
                vus,
                iterations,
                max_duration,
            } => {
                if *vus == 0 || *iterations == 0 {
                    return invalid("vus and iterations must be greater than 0");
                }
                if max_duration.is_zero() {
                    return invalid("max_duration must be greater than 0");
                }
            }
            Self::SharedIterations {
                vus,
                iterations,
                max_duration,
            } => {
                if *vus == 0 {
                    return invalid("vus must be greater than 0");
                }
                if (*vus as u64) > *iterations {
                    return invalid("iterations must be at least the number of vus");
                }
                if max_duration.is_zero() {
                    return invalid("max_duration must be greater than 0");
                }
            }
            Self::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
            } => {
                if !rate.is_finite() || *rate <= 0.0 {
                    return invalid("rate must be a positive number");
                }
                if duration.is_zero() {
                    return invalid("duration must be greater than 0");
                }
                validate_reserve(name, *time_unit, *pre_allocated_vus, *max_vus)?;
            }
            Self::RampingArrivalRate {
                start_rate,
                time_unit,
                stages,
                pre_allocated_vus,
                max_vus,
            } => {
                if !start_rate.is_finite() || *start_rate < 0.0 {
                    return invalid("start_rate must be a non-negative number");
                }
                validate_stages(name, stages)?;
                validate_reserve(name, *time_unit, *pre_allocated_vus, *max_vus)?;
            }
            Self::ExternallyControlled { vus, max_vus, .. } => {
                if max_vus.is_some_and(|max| max < *vus) {
                    return invalid("max_vus must be at least vus");
                }
            }
        }
        Ok(())
    }
}

fn validate_stages(name: &str, stages: &[Stage]) -> Result<(), ConfigError> {
    if stages.is_empty() {
        return Err(ConfigError::invalid(name, "at least one stage is required"));
    }
    for (index, stage) in stages.iter().enumerate() {
        if !stage.target.is_finite() || stage.target < 0.0 {
            return Err(ConfigError::MalformedStage {
                name: name.to_string(),
                index,
                reason: format!("target {} is not a non-negative number", stage.target),
            });
        }
    }
    if stages.iter().all(|s| s.duration.is_zero()) {
        return Err(ConfigError::MalformedStage {
            name: name.to_string(),
            index: stages.len() - 1,
            reason: "stages must span a non-zero duration".to_string(),
        });
    }
    Ok(())
}

fn validate_reserve(
    name: &str,
    time_unit: Duration,
    pre_allocated_vus: usize,
    max_vus: Option<usize>,
) -> Result<(), ConfigError> {
    if time_unit.is_zero() {
        return Err(ConfigError::invalid(name, "time_unit must be greater than 0"));
    }
    if pre_allocated_vus == 0 && max_vus.unwrap_or(0) == 0 {
        return Err(ConfigError::invalid(name, "pre_allocated_vus must be greater than 0"));
    }
    if max_vus.is_some_and(|max| max < pre_allocated_vus) {
        return Err(ConfigError::invalid(
            name,
            "max_vus must be at least pre_allocated_vus",
        ));
    }
    Ok(())
}

/// A validated profile with every executor placed on the run timeline.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub executors: Vec<PlannedExecutor>,
    /// Highest number of workers simultaneously needed by overlapping executors.
    pub peak_workers: usize,
    /// Pool ceiling the run is held to.
    pub ceiling: usize,
    /// Slots created before the run starts.
    pub preallocate: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedExecutor {
    pub name: String,
    pub start: Duration,
    pub planned_duration: Duration,
    pub graceful_stop: Duration,
    pub max_workers: usize,
}

impl PlannedExecutor {
    /// End of the window during which the executor may hold slots.
    pub fn release_deadline(&self) -> Duration {
        self.start
            .saturating_add(self.planned_duration)
            .saturating_add(self.graceful_stop)
    }
}

impl LoadProfile {
    pub fn new(executors: Vec<ExecutorConfig>) -> Self {
        Self {
            executors,
            max_workers: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Checks the profile and lays it out on the run timeline.
    pub fn validate(&self) -> Result<Plan, ConfigError> {
        if self.executors.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut seen = HashSet::new();
        let mut executors = Vec::with_capacity(self.executors.len());
        let mut next_start = Duration::ZERO;
        let mut unbounded: Option<&str> = None;
        for config in &self.executors {
            if config.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !seen.insert(config.name.as_str()) {
                return Err(ConfigError::DuplicateName(config.name.clone()));
            }
            config.kind.validate(&config.name)?;

            if let (None, Some(previous)) = (config.start_time, unbounded) {
                return Err(ConfigError::invalid(
                    &config.name,
                    format!("start_time is required after `{previous}`, which runs until stopped"),
                ));
            }
            let start = config.start_time.unwrap_or(next_start);
            let mut planned_duration = config.kind.planned_duration();
            if planned_duration.is_zero()
                && matches!(config.kind, ExecutorKind::ExternallyControlled { .. })
            {
                planned_duration = Duration::MAX;
                unbounded = Some(config.name.as_str());
            } else {
                unbounded = None;
            }
            next_start = start.saturating_add(planned_duration);
            executors.push(PlannedExecutor {
                name: config.name.clone(),
                start,
                planned_duration,
                graceful_stop: config.graceful_stop,
                max_workers: config.kind.max_workers(),
            });
        }

        let peak_workers = peak_concurrency(&executors);
        let ceiling = match self.max_workers {
            Some(ceiling) if ceiling < peak_workers => {
                return Err(ConfigError::ConcurrencyExceedsCeiling {
                    required: peak_workers,
                    ceiling,
                });
            }
            Some(ceiling) => ceiling,
            None => peak_workers,
        };
        let preallocate = self
            .executors
            .iter()
            .map(|c| c.kind.initial_workers())
            .max()
            .unwrap_or(0)
            .min(ceiling);

        Ok(Plan {
            executors,
            peak_workers,
            ceiling,
            preallocate,
        })
    }
}

/// Peak of summed `max_workers` over half-open `[start, release_deadline)` windows.
fn peak_concurrency(executors: &[PlannedExecutor]) -> usize {
    let mut edges: Vec<(Duration, i64)> = Vec::with_capacity(executors.len() * 2);
    for e in executors {
        edges.push((e.start, e.max_workers as i64));
        edges.push((e.release_deadline(), -(e.max_workers as i64)));
    }
    // releases sort before acquisitions at the same instant
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut current = 0i64;
    let mut peak = 0i64;
    for (_, delta) in edges {
        current += delta;
        peak = peak.max(current);
    }
    peak as usize
}

/// Whole workers for a fractional target.
pub(crate) fn vus_for(target: f64) -> usize {
    if !target.is_finite() || target <= 0.0 {
        return 0;
    }
    (target + 1e-9).floor() as usize
}

fn one() -> usize {
    1
}

fn one_u64() -> u64 {
    1
}

fn default_graceful_stop() -> Duration {
    DEFAULT_GRACEFUL_STOP
}

fn default_graceful_ramp_down() -> Duration {
    DEFAULT_GRACEFUL_RAMP_DOWN
}

fn default_max_duration() -> Duration {
    DEFAULT_MAX_DURATION
}

fn default_time_unit() -> Duration {
    DEFAULT_TIME_UNIT
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

/// `"1m30s"` style durations.
pub(crate) mod duration_format {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }
}

pub(crate) mod option_duration_format {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(raw.trim()).map_err(D::Error::custom))
            .transpose()
    }
}
