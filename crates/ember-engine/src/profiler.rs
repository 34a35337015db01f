use crate::plan::ExecutionPlan;
use crate::provider::ExecutionProvider;
use crate::{EngineError, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wall-clock span of one executed step
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepTiming {
    pub step: usize,
    pub started: Instant,
    pub duration: Duration,
}

/// One profiled step execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEvent {
    pub run: u64,
    pub name: String,
    pub op_type: String,
    pub provider: String,
    /// Microseconds since profiling started
    pub start_us: u64,
    pub duration_us: u64,
}

pub(crate) struct Profiler {
    enabled: bool,
    dir: PathBuf,
    origin: Instant,
    runs: u64,
    events: Vec<ProfileEvent>,
}

impl Profiler {
    pub fn new(enabled: bool, dir: PathBuf) -> Self {
        Profiler {
            enabled,
            dir,
            origin: Instant::now(),
            runs: 0,
            events: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn events(&self) -> &[ProfileEvent] {
        &self.events
    }

    pub fn record_run(
        &mut self,
        plan: &ExecutionPlan,
        providers: &[Arc<dyn ExecutionProvider>],
        timings: &[StepTiming],
    ) {
        if !self.enabled {
            return;
        }
        self.runs += 1;
        for timing in timings {
            let Some(step) = plan.steps.get(timing.step) else {
                continue;
            };
            self.events.push(ProfileEvent {
                run: self.runs,
                name: step.name.clone(),
                op_type: step.op_type.clone(),
                provider: providers
                    .get(step.provider)
                    .map(|p| p.name().to_string())
                    .unwrap_or_default(),
                start_us: timing.started.saturating_duration_since(self.origin).as_micros() as u64,
                duration_us: timing.duration.as_micros() as u64,
            });
        }
    }

    /// Write the collected events and stop profiling
    pub fn finish(&mut self, session_id: u64) -> Result<PathBuf> {
        if !self.enabled {
            return Err(EngineError::configuration(
                "profiling is not enabled for this session",
            ));
        }
        fs::create_dir_all(&self.dir)?;
        let stamp = ember_base::format_timestamp().replace(':', "-");
        let path = self
            .dir
            .join(format!("ember_profile_{}_{}.json", stamp, session_id));
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.events)?;

        log::info!(
            "session {} wrote {} profile events to {}",
            session_id,
            self.events.len(),
            path.display()
        );
        self.enabled = false;
        self.events.clear();
        Ok(path)
    }
}
