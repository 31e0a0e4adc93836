//! Setpoint method evaluation
//!
//! A method is an ordered list of segments. Duration methods are indexed by
//! the time since the method started; daily methods by the local time of day.
//!
//! Within a segment the setpoint ramps linearly from `setpoint_start` to
//! `setpoint_end` (flat when no end is given). A segment with zero duration
//! is terminal: it either holds `setpoint_start` forever or, when `repeat` is
//! set, restarts the method from its first segment.

use chrono::{DateTime, Local, Utc};
use vd_error::{Result, VerdantError};

use super::schedule::seconds_since_midnight;
use crate::data::{Method, MethodData, MethodKind};

/// Result of evaluating a method at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MethodOutput {
    pub value: f64,
    /// The method has run past its last segment
    pub ended: bool,
}

impl MethodOutput {
    fn running(value: f64) -> Self {
        Self { value, ended: false }
    }
}

fn interpolate(segment: &MethodData, into: f64) -> f64 {
    match segment.setpoint_end {
        Some(end) if segment.duration_sec > 0.0 => {
            let fraction = (into / segment.duration_sec).clamp(0.0, 1.0);
            segment.setpoint_start + (end - segment.setpoint_start) * fraction
        }
        _ => segment.setpoint_start,
    }
}

fn final_value(segment: &MethodData) -> f64 {
    segment.setpoint_end.unwrap_or(segment.setpoint_start)
}

fn sorted_segments(method: &Method) -> Result<Vec<&MethodData>> {
    if method.segments.is_empty() {
        return Err(VerdantError::config(format!("method {} has no segments", method.id)));
    }
    let mut segments: Vec<&MethodData> = method.segments.iter().collect();
    segments.sort_by(|a, b| a.start_offset_sec.total_cmp(&b.start_offset_sec));
    Ok(segments)
}

/// Evaluate a method `elapsed_sec` after it started
///
/// Daily methods interpret `elapsed_sec` as seconds since local midnight.
pub fn evaluate(method: &Method, elapsed_sec: f64) -> Result<MethodOutput> {
    let segments = sorted_segments(method)?;
    let t = elapsed_sec.max(0.0);
    match method.kind {
        MethodKind::Daily => Ok(evaluate_daily(&segments, t)),
        MethodKind::Duration => Ok(evaluate_duration(&segments, t)),
    }
}

/// Evaluate a method at `now` for a run that began at `started_at`
pub fn evaluate_at(method: &Method, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<MethodOutput> {
    let t = match method.kind {
        MethodKind::Daily => seconds_since_midnight(&now.with_timezone(&Local)),
        MethodKind::Duration => (now - started_at).num_milliseconds() as f64 / 1000.0,
    };
    evaluate(method, t)
}

/// Start time of every segment up to and including the first terminal one
///
/// A segment begins after the previous one ends, or at its own offset when
/// that is later; the gap holds the previous value.
fn layout(segments: &[&MethodData]) -> (Vec<f64>, Option<usize>) {
    let mut starts = Vec::with_capacity(segments.len());
    let mut acc: f64 = 0.0;
    for (idx, segment) in segments.iter().enumerate() {
        let start = acc.max(segment.start_offset_sec);
        starts.push(start);
        if segment.duration_sec <= 0.0 {
            return (starts, Some(idx));
        }
        acc = start + segment.duration_sec;
    }
    (starts, None)
}

fn evaluate_duration(segments: &[&MethodData], elapsed: f64) -> MethodOutput {
    let (starts, terminal) = layout(segments);

    let mut t = elapsed;
    if let Some(idx) = terminal {
        let marker = segments[idx];
        if marker.repeat {
            if let Some(end_after) = marker.end_after_sec {
                if elapsed >= end_after {
                    let cycle = starts[idx];
                    let at_end = if cycle > 0.0 { walk(segments, &starts, end_after % cycle) } else { marker.setpoint_start };
                    return MethodOutput { value: at_end, ended: true };
                }
            }
            let cycle = starts[idx];
            if cycle <= 0.0 {
                return MethodOutput::running(marker.setpoint_start);
            }
            t = elapsed % cycle;
        } else if elapsed >= starts[idx] {
            return MethodOutput::running(marker.setpoint_start);
        }
    }

    let last = segments[starts.len() - 1];
    let end_of_last = starts[starts.len() - 1] + last.duration_sec.max(0.0);
    if terminal.is_none() && t >= end_of_last {
        return MethodOutput { value: final_value(last), ended: true };
    }
    MethodOutput::running(walk(segments, &starts, t))
}

/// Value at `t` within the laid-out (non-terminal) segments
fn walk(segments: &[&MethodData], starts: &[f64], t: f64) -> f64 {
    let mut value = segments[0].setpoint_start;
    for (segment, start) in segments.iter().zip(starts) {
        if t < *start {
            return value;
        }
        if segment.duration_sec <= 0.0 {
            return segment.setpoint_start;
        }
        if t < start + segment.duration_sec {
            return interpolate(segment, t - start);
        }
        value = final_value(segment);
    }
    value
}

fn evaluate_daily(segments: &[&MethodData], seconds: f64) -> MethodOutput {
    // The segment in effect is the latest one starting at or before now; before
    // the first segment of the day the last one of the previous day still holds
    let current = segments
        .iter()
        .rev()
        .find(|s| s.start_offset_sec <= seconds)
        .or_else(|| segments.last());

    match current {
        Some(segment) if seconds >= segment.start_offset_sec => {
            let into = seconds - segment.start_offset_sec;
            if segment.duration_sec > 0.0 && into < segment.duration_sec {
                MethodOutput::running(interpolate(segment, into))
            } else if segment.duration_sec > 0.0 {
                MethodOutput::running(final_value(segment))
            } else {
                MethodOutput::running(segment.setpoint_start)
            }
        }
        Some(segment) => MethodOutput::running(if segment.duration_sec > 0.0 {
            final_value(segment)
        } else {
            segment.setpoint_start
        }),
        None => MethodOutput::running(0.0),
    }
}
