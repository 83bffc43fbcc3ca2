//! Execution Timeline
//!
//! Tracks step start/end times for generating execution
//! reports and Gantt charts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::workflow::state::{StepStatus, WorkflowExecution};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Tracks the execution timeline of a chain run.
///
/// Built either live with [`add_event`](Self::add_event) or after the fact
/// from a [`WorkflowExecution`] snapshot.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start_time: DateTime<Utc>) -> Self {
        Self {
            events: Vec::new(),
            start_time,
            end_time: None,
        }
    }

    /// Rebuilds the timeline of a recorded execution. Steps that never
    /// started (pending or skipped) contribute no events.
    pub fn from_execution(execution: &WorkflowExecution) -> Self {
        let mut timeline = Self::starting_at(execution.started_at);
        timeline.end_time = execution.completed_at;

        for outcome in &execution.steps {
            let Some(started) = outcome.started_at else {
                continue;
            };
            timeline.add_event_at(outcome.step_id.clone(), EventType::Started, started);

            let finished = match outcome.status {
                StepStatus::Completed => Some(EventType::Completed),
                StepStatus::Failed => Some(EventType::Failed),
                _ => None,
            };
            if let (Some(event_type), Some(at)) = (finished, outcome.completed_at) {
                timeline.add_event_at(outcome.step_id.clone(), event_type, at);
            }
        }

        timeline.events.sort_by_key(|e| e.timestamp);
        timeline
    }

    /// Records an event for a step at the current time.
    pub fn add_event(&mut self, step_id: String, event_type: EventType) {
        self.add_event_at(step_id, event_type, Utc::now());
    }

    pub fn add_event_at(&mut self, step_id: String, event_type: EventType, at: DateTime<Utc>) {
        self.events.push(TimelineEvent {
            step_id,
            event_type,
            timestamp: at,
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time from the start of the timeline to its end, or to now while the
    /// run is still going.
    pub fn elapsed(&self) -> std::time::Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }

    fn offset_ms(&self, at: DateTime<Utc>) -> u128 {
        (at - self.start_time).num_milliseconds().max(0) as u128
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut step_times: HashMap<&str, (u128, Option<u128>, EventType)> = HashMap::new();
        for event in &self.events {
            let elapsed = self.offset_ms(event.timestamp);
            match event.event_type {
                EventType::Started => {
                    step_times.insert(&event.step_id, (elapsed, None, EventType::Started));
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(times) = step_times.get_mut(event.step_id.as_str()) {
                        times.1 = Some(elapsed);
                        times.2 = event.event_type;
                    }
                }
            }
        }

        let mut sorted_steps: Vec<_> = step_times.into_iter().collect();
        sorted_steps.sort_by(|(a_id, (a_start, ..)), (b_id, (b_start, ..))| {
            a_start.cmp(b_start).then_with(|| a_id.cmp(b_id))
        });

        for (step_id, (start, end, last)) in sorted_steps {
            let Some(end) = end else { continue };
            let start_pos = (start as f64 * scale) as usize;
            let width = (end.saturating_sub(start) as f64 * scale).max(1.0) as usize;
            let fill = if last == EventType::Failed { "x" } else { "#" };

            output.push_str(&format!(
                "{:12} |{}{}| ({} ms)\n",
                truncate(step_id, 12),
                " ".repeat(start_pos),
                fill.repeat(width),
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            let elapsed = self.offset_ms(event.timestamp);
            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.step_id, elapsed);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(event.step_id.as_str()) {
                        durations.insert(event.step_id.clone(), elapsed.saturating_sub(*start));
                    }
                }
            }
        }

        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
