//! Reporting collaborators fed by the metrics recorder.

use std::time::Duration;

use super::{Sample, Summary};

mod human;
mod json;

pub use self::{human::HumanReporter, json::JsonlReporter};

pub trait Reporter: Send + 'static {
    fn on_sample(&mut self, elapsed: Duration, sample: &Sample);
    fn on_tick(&mut self, now: Duration);
    fn finish(&mut self, summary: &Summary);
}
