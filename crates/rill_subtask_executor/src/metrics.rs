use metrics::{counter, describe_counter, describe_gauge, gauge, Label};

/// A counter carrying runtime-determined label values, backed by the
/// `metrics` registry.
pub struct LabeledMetricCounter {
    name: &'static str,
    description: &'static str,
}

impl LabeledMetricCounter {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }

    pub fn get_name(&self) -> &'static str {
        self.name
    }

    pub fn register(&self) {
        describe_counter!(self.name, self.description);
    }

    pub fn increment(&self, value: u64, labels: &[(&'static str, String)]) {
        let labels: Vec<Label> =
            labels.iter().map(|(key, val)| Label::new(*key, val.clone())).collect();
        counter!(self.name, labels).increment(value);
    }
}

/// A gauge carrying runtime-determined label values.
pub struct LabeledMetricGauge {
    name: &'static str,
    description: &'static str,
}

impl LabeledMetricGauge {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }

    pub fn get_name(&self) -> &'static str {
        self.name
    }

    pub fn register(&self) {
        describe_gauge!(self.name, self.description);
    }

    pub fn set(&self, value: f64, labels: &[(&'static str, String)]) {
        let labels: Vec<Label> =
            labels.iter().map(|(key, val)| Label::new(*key, val.clone())).collect();
        gauge!(self.name, labels).set(value);
    }
}

pub const LABEL_BAND: &str = "band";
pub const LABEL_SESSION_ID: &str = "session_id";
pub const LABEL_SUBTASK_ID: &str = "subtask_id";

pub const SUBMITTED_SUBTASK_COUNT: LabeledMetricCounter = LabeledMetricCounter::new(
    "rill_band_submitted_subtask_count",
    "The count of subtasks submitted to the band",
);
pub const FINISHED_SUBTASK_COUNT: LabeledMetricCounter = LabeledMetricCounter::new(
    "rill_band_finished_subtask_count",
    "The count of subtasks finished on the band",
);
pub const SUBTASK_EXECUTION_TIME_SECS: LabeledMetricGauge = LabeledMetricGauge::new(
    "rill_subtask_execution_time_secs",
    "Time in seconds taken to execute a subtask",
);

pub fn register_metrics() {
    SUBMITTED_SUBTASK_COUNT.register();
    FINISHED_SUBTASK_COUNT.register();
    SUBTASK_EXECUTION_TIME_SECS.register();
}
