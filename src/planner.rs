//! Motion/Exposure Planner
//!
//! Turns a [`Job`] into the ordered primitive commands the controller
//! understands. Planning is pure: the same job and configuration always give
//! the same plan, and every validation failure surfaces here, before anything
//! reaches the hardware.
//!
//! Laser power is emitted lazily. A `SetPower` step only records the power in
//! effect; the planner writes it to the device right before the next exposure,
//! and only if it differs from what was last written.

use crate::codec::{Command, Exposure};
use crate::config::{PlannerConfig, TravelLimits};
use crate::job::{ExposureSpec, Job, Point, Step};
use crate::units::{FeedRate, Power, StagePosition, MAX_COMMAND_DURATION, MAX_COORDINATE_MICRONS};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("step {step}: power {percent}% is outside the device range {min}%..={max}%")]
    PowerOutOfRange { step: usize, percent: f64, min: f64, max: f64 },

    #[error("step {step}: exposure before the stage position is known")]
    UndefinedPosition { step: usize },

    #[error("step {step}: exposure before a laser power is set")]
    UndefinedPower { step: usize },

    #[error("step {step}: no feed rate on the step and no default feed")]
    UndefinedFeed { step: usize },

    #[error("step {step}: target {target} is outside the stage travel limits")]
    OutsideTravelLimits { step: usize, target: String },

    #[error("step {step}: {reason}")]
    InvalidValue { step: usize, reason: String },

    #[error("cannot resume at step {first_step}, job has {step_count} steps")]
    ResumeOutOfRange { first_step: usize, step_count: usize },
}

impl PlanError {
    /// Index of the offending step, when the error is tied to one
    pub fn step(&self) -> Option<usize> {
        match self {
            PlanError::PowerOutOfRange { step, .. }
            | PlanError::UndefinedPosition { step }
            | PlanError::UndefinedPower { step }
            | PlanError::UndefinedFeed { step }
            | PlanError::OutsideTravelLimits { step, .. }
            | PlanError::InvalidValue { step, .. } => Some(*step),
            PlanError::ResumeOutOfRange { .. } => None,
        }
    }
}

/// A primitive command and the job step it was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedCommand {
    pub step: usize,
    pub command: Command,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanSummary {
    pub command_count: usize,
    /// Stage travel covered by moves and path exposures, in micrometres
    pub path_length_microns: f64,
    pub exposure_time: Duration,
    /// Sum of the expected controller time of every command
    pub estimated_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub job_name: String,
    /// First job step covered by this plan (non-zero when resuming)
    pub first_step: usize,
    pub step_count: usize,
    /// Stage position before the first command, if known
    pub start_position: Option<StagePosition>,
    pub commands: Vec<PlannedCommand>,
    pub summary: PlanSummary,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

/// Running state while walking the steps
#[derive(Debug, Default)]
struct PlanState {
    position: Option<StagePosition>,
    /// Power in effect for the next exposure
    power: Option<Power>,
    /// Power last written to the device
    emitted_power: Option<Power>,
    /// Feed of the most recent motion, used to re-establish position on resume
    last_feed: Option<FeedRate>,
}

pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Plan a whole job
    pub fn plan(&self, job: &Job) -> Result<Plan, PlanError> {
        self.plan_from(job, 0)
    }

    /// Plan a job resuming at `first_step`. Earlier steps are still validated
    /// and replayed to recover position and power, but emit nothing.
    pub fn plan_from(&self, job: &Job, first_step: usize) -> Result<Plan, PlanError> {
        if first_step > job.steps.len() {
            return Err(PlanError::ResumeOutOfRange {
                first_step,
                step_count: job.steps.len(),
            });
        }

        let offset = job.parameters.focus_offset;
        let mut state = PlanState::default();
        if let Some(origin) = job.origin {
            state.position = Some(self.stage_target(0, origin, offset)?);
        }
        if let Some(percent) = job.parameters.power {
            state.power = Some(self.resolve_power(0, percent)?);
        }
        let default_feed = match job.parameters.feed {
            Some(rate) => Some(resolve_feed(0, rate)?),
            None => None,
        };

        let mut commands = Vec::new();
        let mut start_position = state.position;

        for (index, step) in job.steps.iter().enumerate() {
            if index == first_step && first_step > 0 {
                start_position = self.resume_at(index, &mut state, &mut commands);
            }

            let emitted = self.plan_step(index, step, offset, default_feed, &mut state)?;
            if index >= first_step {
                commands.extend(emitted.into_iter().map(|command| PlannedCommand { step: index, command }));
            }
        }

        let summary = summarize(start_position, &commands);
        debug!(
            "Planned {} commands for job '{}' from step {}",
            commands.len(),
            job.name,
            first_step
        );

        Ok(Plan {
            job_name: job.name.clone(),
            first_step,
            step_count: job.steps.len(),
            start_position,
            commands,
            summary,
        })
    }

    /// Re-establish the replayed state before the first resumed step. Returns
    /// the stage position the resumed plan starts from.
    fn resume_at(
        &self,
        index: usize,
        state: &mut PlanState,
        commands: &mut Vec<PlannedCommand>,
    ) -> Option<StagePosition> {
        // The device may hold any power after an interruption
        state.emitted_power = None;

        // Without any feed nothing has moved, so the stage is still at origin
        if let (Some(target), Some(feed)) = (state.position, state.last_feed) {
            commands.push(PlannedCommand {
                step: index,
                command: Command::MoveTo { target, feed },
            });
            return None;
        }
        state.position
    }

    fn plan_step(
        &self,
        index: usize,
        step: &Step,
        offset: f64,
        default_feed: Option<FeedRate>,
        state: &mut PlanState,
    ) -> Result<Vec<Command>, PlanError> {
        let mut out = Vec::new();
        match step {
            Step::Move { to, feed } => {
                let target = self.stage_target(index, *to, offset)?;
                let feed = step_feed(index, *feed, default_feed)?;
                state.last_feed = Some(feed);
                if state.position == Some(target) {
                    return Ok(out);
                }
                if let Some(from) = state.position {
                    check_motion(index, from, target, feed)?;
                }
                out.push(Command::MoveTo { target, feed });
                state.position = Some(target);
            }
            Step::SetPower { percent } => {
                state.power = Some(self.resolve_power(index, *percent)?);
            }
            Step::Expose { exposure } => {
                let from = state.position.ok_or(PlanError::UndefinedPosition { step: index })?;
                let power = state.power.ok_or(PlanError::UndefinedPower { step: index })?;

                let exposure = match exposure {
                    ExposureSpec::Duration { seconds } => {
                        let duration = resolve_duration(index, *seconds)?;
                        if duration.is_zero() {
                            return Ok(out);
                        }
                        Exposure::Timed { duration }
                    }
                    ExposureSpec::Path { to, feed } => {
                        let target = self.stage_target(index, *to, offset)?;
                        let feed = step_feed(index, *feed, default_feed)?;
                        state.last_feed = Some(feed);
                        if target == from {
                            return Ok(out);
                        }
                        check_motion(index, from, target, feed)?;
                        state.position = Some(target);
                        Exposure::Path { target, feed }
                    }
                };

                if state.emitted_power != Some(power) {
                    out.push(Command::SetPower { power });
                    state.emitted_power = Some(power);
                }
                out.push(Command::Expose { exposure });
            }
            Step::Dwell { seconds } => {
                let duration = resolve_duration(index, *seconds)?;
                if !duration.is_zero() {
                    out.push(Command::WaitSettle { duration });
                }
            }
        }
        Ok(out)
    }

    /// Clamp `percent` to the device range if it is within tolerance of it
    fn resolve_power(&self, step: usize, percent: f64) -> Result<Power, PlanError> {
        let min = self.config.power_min();
        let max = self.config.power_max();
        let tolerance = self.config.power_tolerance();
        if !percent.is_finite() || percent < min - tolerance || percent > max + tolerance {
            return Err(PlanError::PowerOutOfRange { step, percent, min, max });
        }
        Ok(Power::from_percent(percent.clamp(min, max)))
    }

    fn stage_target(&self, step: usize, point: Point, offset: f64) -> Result<StagePosition, PlanError> {
        let coords = [point.x, point.y, point.z + offset];
        if coords.iter().any(|c| !c.is_finite() || c.abs() > MAX_COORDINATE_MICRONS) {
            return Err(PlanError::InvalidValue {
                step,
                reason: format!(
                    "coordinate in {:?} is not within ±{} µm",
                    point, MAX_COORDINATE_MICRONS
                ),
            });
        }
        let target = StagePosition::from_microns(coords[0], coords[1], coords[2]);
        if let Some(limits) = &self.config.travel_limits {
            if !within_limits(limits, &target) {
                return Err(PlanError::OutsideTravelLimits { step, target: target.to_string() });
            }
        }
        Ok(target)
    }
}

fn within_limits(limits: &TravelLimits, target: &StagePosition) -> bool {
    let axes = [target.x.as_microns(), target.y.as_microns(), target.z.as_microns()];
    axes.iter()
        .enumerate()
        .all(|(axis, value)| *value >= limits.min[axis] && *value <= limits.max[axis])
}

fn resolve_feed(step: usize, rate: f64) -> Result<FeedRate, PlanError> {
    FeedRate::from_microns_per_second(rate).ok_or_else(|| PlanError::InvalidValue {
        step,
        reason: format!("feed rate {} µm/s is not positive", rate),
    })
}

fn step_feed(step: usize, feed: Option<f64>, default_feed: Option<FeedRate>) -> Result<FeedRate, PlanError> {
    match feed {
        Some(rate) => resolve_feed(step, rate),
        None => default_feed.ok_or(PlanError::UndefinedFeed { step }),
    }
}

/// Round to whole microseconds, the resolution the controller works in
fn resolve_duration(step: usize, seconds: f64) -> Result<Duration, PlanError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(PlanError::InvalidValue {
            step,
            reason: format!("duration {} s is not a valid time", seconds),
        });
    }
    if seconds > MAX_COMMAND_DURATION.as_secs_f64() {
        return Err(PlanError::InvalidValue {
            step,
            reason: format!("duration {} s exceeds {:?}", seconds, MAX_COMMAND_DURATION),
        });
    }
    Ok(Duration::from_micros((seconds * 1_000_000.0).round() as u64))
}

fn check_motion(
    step: usize,
    from: StagePosition,
    to: StagePosition,
    feed: FeedRate,
) -> Result<(), PlanError> {
    let travel = feed.travel_time(from.distance_microns(&to));
    if travel > MAX_COMMAND_DURATION {
        return Err(PlanError::InvalidValue {
            step,
            reason: format!("move to {} takes {:?}, longer than {:?}", to, travel, MAX_COMMAND_DURATION),
        });
    }
    Ok(())
}

fn summarize(start: Option<StagePosition>, commands: &[PlannedCommand]) -> PlanSummary {
    let mut summary = PlanSummary {
        command_count: commands.len(),
        ..Default::default()
    };
    let mut position = start;
    for planned in commands {
        let command = &planned.command;
        // Motion from an unknown position has no known length or duration
        let expected = match (position, command.target()) {
            (None, Some(_)) => Duration::ZERO,
            (from, _) => command.expected_duration(&from.unwrap_or_default()),
        };
        if let (Some(from), Some(to)) = (position, command.target()) {
            summary.path_length_microns += from.distance_microns(&to);
        }
        if matches!(command, Command::Expose { .. }) {
            summary.exposure_time = summary.exposure_time.saturating_add(expected);
        }
        summary.estimated_duration = summary.estimated_duration.saturating_add(expected);
        if let Some(to) = command.target() {
            position = Some(to);
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ProcessParameters;

    fn planner() -> Planner {
        Planner::new(PlannerConfig::default())
    }

    fn params(feed: f64) -> ProcessParameters {
        ProcessParameters { feed: Some(feed), power: None, focus_offset: 0.0 }
    }

    fn mv(x: f64) -> Step {
        Step::Move { to: Point::new(x, 0.0, 0.0), feed: None }
    }

    fn dot(seconds: f64) -> Step {
        Step::Expose { exposure: ExposureSpec::Duration { seconds } }
    }

    fn power(percent: f64) -> Step {
        Step::SetPower { percent }
    }

    fn commands(plan: &Plan) -> Vec<Command> {
        plan.commands.iter().map(|c| c.command).collect()
    }

    fn grid_job() -> Job {
        Job::new(
            "grid",
            vec![mv(10.0), power(20.0), dot(0.01), mv(20.0), dot(0.01), power(30.0), dot(0.01)],
        )
        .with_parameters(params(100.0))
    }

    #[test]
    fn test_plan_is_deterministic() {
        let job = grid_job();
        assert_eq!(planner().plan(&job).unwrap(), planner().plan(&job).unwrap());
    }

    #[test]
    fn test_consecutive_exposures_share_one_set_power() {
        let job = Job::new("pair", vec![mv(10.0), power(20.0), dot(0.01), dot(0.02)])
            .with_parameters(params(100.0));
        let plan = planner().plan(&job).unwrap();
        let set_powers = commands(&plan)
            .iter()
            .filter(|c| matches!(c, Command::SetPower { .. }))
            .count();
        assert_eq!(set_powers, 1);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn test_order_and_step_indices_are_preserved() {
        let plan = planner().plan(&grid_job()).unwrap();
        let opcodes: Vec<&str> = commands(&plan).iter().map(|c| c.opcode()).collect();
        assert_eq!(
            opcodes,
            vec!["MOVE", "POWER", "EXPOSE", "MOVE", "EXPOSE", "POWER", "EXPOSE"]
        );
        let steps: Vec<usize> = plan.commands.iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![0, 2, 2, 3, 4, 6, 6]);
    }

    #[test]
    fn test_zero_length_segments_are_dropped() {
        let job = Job::new(
            "zero",
            vec![
                mv(10.0),
                mv(10.0),
                power(10.0),
                dot(0.0),
                Step::Expose {
                    exposure: ExposureSpec::Path { to: Point::new(10.0, 0.0, 0.0), feed: None },
                },
                Step::Dwell { seconds: 0.0 },
            ],
        )
        .with_parameters(params(100.0));
        let plan = planner().plan(&job).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_durations_are_quantized_to_microseconds() {
        let job = Job::new("short", vec![mv(1.0), power(10.0), dot(4e-7), dot(6e-7)])
            .with_parameters(params(10.0));
        let plan = planner().plan(&job).unwrap();
        let timed = Command::Expose {
            exposure: Exposure::Timed { duration: Duration::from_micros(1) },
        };
        // The first exposure rounds to nothing and is dropped with its power
        assert_eq!(plan.commands[1].step, 3);
        assert_eq!(plan.commands[2].command, timed);

        let codec = crate::codec::Codec::new().unwrap();
        for planned in &plan.commands {
            let frame = crate::codec::CommandFrame { id: 1, command: planned.command };
            let decoded = codec.decode_command(&codec.encode_command(&frame)).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_oversized_values_are_rejected() {
        let huge_dwells = Job::new(
            "huge",
            vec![Step::Dwell { seconds: 1e19 }, Step::Dwell { seconds: 1e19 }],
        );
        assert!(matches!(planner().plan(&huge_dwells), Err(PlanError::InvalidValue { step: 0, .. })));

        let far = Job::new("far", vec![mv(1e300)]).with_parameters(params(10.0));
        assert!(matches!(planner().plan(&far), Err(PlanError::InvalidValue { step: 0, .. })));

        // 1e6 µm at 0.1 µm/s is far longer than a day
        let slow = Job::new("slow", vec![mv(0.0), mv(1e6)]).with_parameters(params(0.1));
        assert!(matches!(planner().plan(&slow), Err(PlanError::InvalidValue { step: 1, .. })));

        // Longest allowed dwells still sum without overflow
        let day = MAX_COMMAND_DURATION.as_secs_f64();
        let long = Job::new("long", vec![Step::Dwell { seconds: day }, Step::Dwell { seconds: day }]);
        let summary = planner().plan(&long).unwrap().summary;
        assert_eq!(summary.estimated_duration, MAX_COMMAND_DURATION * 2);
    }

    #[test]
    fn test_power_within_tolerance_is_clamped() {
        let job = Job::new("hot", vec![mv(1.0), power(100.3), dot(0.01)]).with_parameters(params(10.0));
        let plan = planner().plan(&job).unwrap();
        assert_eq!(plan.commands[1].command, Command::SetPower { power: Power::FULL });

        let job = Job::new("cold", vec![mv(1.0), power(-0.2), dot(0.01)]).with_parameters(params(10.0));
        let plan = planner().plan(&job).unwrap();
        assert_eq!(plan.commands[1].command, Command::SetPower { power: Power::OFF });
    }

    #[test]
    fn test_power_beyond_tolerance_is_rejected() {
        let job = Job::new("hot", vec![mv(1.0), power(101.0), dot(0.01)]).with_parameters(params(10.0));
        assert!(matches!(
            planner().plan(&job),
            Err(PlanError::PowerOutOfRange { step: 1, .. })
        ));
    }

    #[test]
    fn test_undefined_parameters_are_rejected() {
        let no_position = Job::new("a", vec![power(10.0), dot(0.1)]);
        assert_eq!(planner().plan(&no_position), Err(PlanError::UndefinedPosition { step: 1 }));

        let no_power = Job::new("b", vec![mv(1.0), dot(0.1)]).with_parameters(params(10.0));
        assert_eq!(planner().plan(&no_power), Err(PlanError::UndefinedPower { step: 1 }));

        let no_feed = Job::new("c", vec![mv(1.0)]);
        assert_eq!(planner().plan(&no_feed), Err(PlanError::UndefinedFeed { step: 0 }));

        let bad_dwell = Job::new("d", vec![Step::Dwell { seconds: -1.0 }]);
        assert!(matches!(planner().plan(&bad_dwell), Err(PlanError::InvalidValue { step: 0, .. })));
    }

    #[test]
    fn test_job_defaults_and_origin() {
        let job = Job::new("defaults", vec![dot(0.5)])
            .with_origin(Point::new(1.0, 2.0, 3.0))
            .with_parameters(ProcessParameters { feed: None, power: Some(50.0), focus_offset: 0.0 });
        let plan = planner().plan(&job).unwrap();
        assert_eq!(
            commands(&plan),
            vec![
                Command::SetPower { power: Power(5000) },
                Command::Expose { exposure: Exposure::Timed { duration: Duration::from_millis(500) } },
            ]
        );
        assert_eq!(plan.summary.exposure_time, Duration::from_millis(500));
    }

    #[test]
    fn test_focus_offset_shifts_z() {
        let job = Job::new("focus", vec![Step::Move { to: Point::new(0.0, 0.0, 5.0), feed: Some(10.0) }])
            .with_parameters(ProcessParameters { feed: None, power: None, focus_offset: -1.5 });
        let plan = planner().plan(&job).unwrap();
        assert_eq!(plan.commands[0].command.target(), Some(StagePosition::new(0, 0, 35)));
    }

    #[test]
    fn test_travel_limits() {
        let config = PlannerConfig {
            travel_limits: Some(TravelLimits { min: [0.0; 3], max: [100.0; 3] }),
            ..Default::default()
        };
        let job = Job::new("far", vec![mv(50.0), mv(150.0)]).with_parameters(params(10.0));
        assert!(matches!(
            Planner::new(config).plan(&job),
            Err(PlanError::OutsideTravelLimits { step: 1, .. })
        ));
    }

    #[test]
    fn test_summary() {
        let job = Job::new("summary", vec![mv(10.0), mv(20.0), power(5.0), dot(1.0)])
            .with_origin(Point::default())
            .with_parameters(params(10.0));
        let summary = planner().plan(&job).unwrap().summary;
        assert_eq!(summary.command_count, 4);
        assert!((summary.path_length_microns - 20.0).abs() < 1e-9);
        assert_eq!(summary.exposure_time, Duration::from_secs(1));
        assert_eq!(summary.estimated_duration, Duration::from_secs(3));
    }

    #[test]
    fn test_resume_reestablishes_position_and_power() {
        let job = grid_job();
        let plan = planner().plan_from(&job, 4).unwrap();
        assert_eq!(plan.first_step, 4);
        assert_eq!(
            commands(&plan),
            vec![
                Command::MoveTo {
                    target: StagePosition::new(200, 0, 0),
                    feed: FeedRate(1000),
                },
                Command::SetPower { power: Power(2000) },
                Command::Expose { exposure: Exposure::Timed { duration: Duration::from_millis(10) } },
                Command::SetPower { power: Power(3000) },
                Command::Expose { exposure: Exposure::Timed { duration: Duration::from_millis(10) } },
            ]
        );
        assert!(plan.commands.iter().all(|c| c.step >= 4));
    }

    #[test]
    fn test_resume_still_validates_earlier_steps() {
        let job = Job::new("bad", vec![power(150.0), mv(1.0)]).with_parameters(params(10.0));
        assert!(matches!(
            planner().plan_from(&job, 1),
            Err(PlanError::PowerOutOfRange { step: 0, .. })
        ));
        assert!(matches!(
            planner().plan_from(&grid_job(), 99),
            Err(PlanError::ResumeOutOfRange { .. })
        ));
    }
}
