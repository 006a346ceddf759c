use log::{Level, log_enabled};
use std::time::{Duration, Instant};

/// Per-step timing and row counts collected by the mechanical system.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepProfile {
    pub update_time: Duration,
    pub assembly_time: Duration,
    pub solve_time: Duration,
    pub writeback_time: Duration,
    pub propagation_time: Duration,
    pub total_step_time: Duration,

    pub entity_count: usize,
    pub bilateral_rows: usize,
    pub unilateral_rows: usize,
    pub friction_sets: usize,
    pub contact_count: usize,
    pub structure_changed: bool,
}

impl StepProfile {
    pub fn report(&self) {
        let total_us = self.total_step_time.as_micros() as f64;
        if total_us < 1.0 {
            return;
        }
        let pct = |d: Duration| d.as_micros() as f64 / total_us * 100.0;

        log::debug!(
            "step: {} entities, {} bilateral / {} unilateral rows, {} friction sets, {} contacts{}",
            self.entity_count,
            self.bilateral_rows,
            self.unilateral_rows,
            self.friction_sets,
            self.contact_count,
            if self.structure_changed { " (structure changed)" } else { "" }
        );
        log::debug!(
            "  total {:.3} ms | update {:.1}% | assemble {:.1}% | solve {:.1}% | write-back {:.1}% | propagate {:.1}%",
            self.total_step_time.as_secs_f64() * 1000.0,
            pct(self.update_time),
            pct(self.assembly_time),
            pct(self.solve_time),
            pct(self.writeback_time),
            pct(self.propagation_time),
        );
    }
}

/// Pipeline stages, used to label timing traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Step,
    Update,
    ConstraintUpdate,
    ContactUpdate,
    Assembly,
    RowAssembly,
    Solve,
    DenseSolve,
    WriteBack,
    ForceWriteBack,
    Propagation,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Step => "mech system step",
            Stage::Update => "state update",
            Stage::ConstraintUpdate => "constraint update",
            Stage::ContactUpdate => "contact update",
            Stage::Assembly => "assembly",
            Stage::RowAssembly => "row assembly",
            Stage::Solve => "solve",
            Stage::DenseSolve => "dense solve",
            Stage::WriteBack => "write-back",
            Stage::ForceWriteBack => "force write-back",
            Stage::Propagation => "attachment propagation",
        }
    }
}

/// Scope guard for one stage. Traces start and end at `trace` level and,
/// when given a profile field, adds the elapsed time to it.
pub struct StageTimer<'a> {
    stage: Stage,
    start: Instant,
    output: Option<&'a mut Duration>,
}

impl StageTimer<'static> {
    pub fn trace(stage: Stage) -> Self {
        Self::start(stage, None)
    }
}

impl<'a> StageTimer<'a> {
    pub fn record(stage: Stage, output: &'a mut Duration) -> Self {
        Self::start(stage, Some(output))
    }

    fn start(stage: Stage, output: Option<&'a mut Duration>) -> Self {
        if log_enabled!(Level::Trace) {
            log::trace!("start {}", stage.label());
        }
        Self {
            stage,
            start: Instant::now(),
            output,
        }
    }
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if let Some(output) = self.output.as_deref_mut() {
            *output += elapsed;
        }
        if log_enabled!(Level::Trace) {
            log::trace!("end {} ({} us)", self.stage.label(), elapsed.as_micros());
        }
    }
}
