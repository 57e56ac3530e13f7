#![forbid(unsafe_code)]

use lesson_loop_domain::{
    now_utc, Constraint, ExecutionTrace, LessonError, MistakeFinding, MistakeKind, PatternKey,
    RunId,
};
use lesson_loop_evaluator::EvaluationRules;
use lesson_loop_memory::{PatternMemory, StoreBackend, StoreDocument};
use serde::Serialize;
use ulid::Ulid;

/// Terminal output of one learning cycle, reported to the caller for
/// display. `success` is derived from the findings, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub success: bool,
    pub findings: Vec<MistakeFinding>,
    pub new_constraints: Vec<Constraint>,
}

/// Display-only learning summary over the bounded history and the store.
#[derive(Debug, Clone, Serialize)]
pub struct LearningStatistics {
    pub total_runs: usize,
    pub successful_runs: usize,
    pub total_mistakes: usize,
    pub learned_constraints: usize,
    /// Mistakes in the last 5 runs vs the previous 5, as a percentage.
    /// Zero until at least 10 runs are on record.
    pub improvement_rate: f64,
    pub pattern_counts: std::collections::BTreeMap<String, u64>,
}

/// Renders the standing guidance for one recurring mistake, embedding the
/// occurrence count at creation time.
#[must_use]
pub fn constraint_text(key: &PatternKey, occurrences: u64) -> String {
    let detail = key.detail();
    let base = match key.kind() {
        MistakeKind::MissingRequiredTool => {
            format!("ALWAYS use the required tool mentioned: {detail}")
        }
        MistakeKind::WrongSequence => format!("Follow the correct tool sequence: {detail}"),
        MistakeKind::TooEarlyAnswer => {
            "Do NOT provide a final answer until ALL necessary tools have been called".to_string()
        }
        MistakeKind::IgnoredToolOutput => {
            format!("MUST incorporate tool outputs into your answer: {detail}")
        }
    };
    format!("{base} (learned from {occurrences} past mistakes)")
}

/// Synthesizes constraints for the keys that crossed the recurrence
/// threshold. Idempotent: a key with an existing constraint never yields a
/// second one, however often it is passed in.
#[must_use]
pub fn synthesize_constraints(
    crossed_keys: &[PatternKey],
    document: &StoreDocument,
    run_id: RunId,
    threshold: u64,
) -> Vec<Constraint> {
    let mut created = Vec::new();

    for key in crossed_keys {
        let occurrences = document
            .patterns
            .get(key)
            .map_or(0, |record| record.occurrence_count);
        if occurrences < threshold {
            continue;
        }

        let exists = document
            .constraints
            .iter()
            .chain(&created)
            .any(|constraint| &constraint.source_pattern_key == key);
        if exists {
            continue;
        }

        created.push(Constraint {
            id: Ulid::new(),
            source_pattern_key: key.clone(),
            text: constraint_text(key, occurrences),
            occurrences_at_creation: occurrences,
            created_at_run_id: run_id,
            created_at: now_utc(),
            active: true,
        });
    }

    created
}

/// Orders a constraint set for injection: most evidenced first, then oldest
/// learned first. Inactive constraints are filtered out.
#[must_use]
pub fn order_for_feed(constraints: &[Constraint]) -> Vec<Constraint> {
    let mut active: Vec<Constraint> = constraints
        .iter()
        .filter(|constraint| constraint.active)
        .cloned()
        .collect();
    // Stable sort keeps creation order within equal occurrence counts.
    active.sort_by(|a, b| b.occurrences_at_creation.cmp(&a.occurrences_at_creation));
    active
}

/// Drives the learning cycle, once per run: evaluate the trace, update
/// pattern memory, synthesize any due constraints, and persist everything
/// in a single durable write. Holds no long-lived mutable state beyond the
/// pattern memory it owns.
pub struct LearningOrchestrator<B: StoreBackend> {
    rules: EvaluationRules,
    memory: PatternMemory<B>,
}

impl<B: StoreBackend> LearningOrchestrator<B> {
    /// # Errors
    /// Returns [`LessonError::Configuration`] when the rule set is invalid.
    pub fn new(rules: EvaluationRules, memory: PatternMemory<B>) -> Result<Self, LessonError> {
        rules.validate()?;
        Ok(Self { rules, memory })
    }

    #[must_use]
    pub fn rules(&self) -> &EvaluationRules {
        &self.rules
    }

    #[must_use]
    pub fn memory(&self) -> &PatternMemory<B> {
        &self.memory
    }

    /// Runs one full cycle for a completed trace.
    ///
    /// # Errors
    /// Returns [`LessonError::Validation`] for a malformed trace (the run is
    /// not counted) and [`LessonError::StoreWrite`] when persistence fails
    /// after its retry (memory stays at pre-run state).
    pub fn record_run(&mut self, trace: &ExecutionTrace) -> Result<RunReport, LessonError> {
        self.rules.validate_trace(trace)?;

        let run_id = self.memory.next_run_id();
        let findings = self.rules.evaluate(trace);

        let mut staged = self.memory.stage_run(run_id, trace, &findings);
        let new_constraints = synthesize_constraints(
            &staged.crossed_keys,
            &staged.document,
            run_id,
            self.memory.threshold(),
        );
        staged
            .document
            .constraints
            .extend(new_constraints.iter().cloned());
        self.memory.commit(staged.document)?;

        Ok(RunReport {
            run_id,
            success: findings.is_empty(),
            findings,
            new_constraints,
        })
    }

    /// The constraint feed consumed by the external agent before each run.
    #[must_use]
    pub fn active_constraints(&self) -> Vec<Constraint> {
        order_for_feed(self.memory.constraints())
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn statistics(&self) -> LearningStatistics {
        let history = self.memory.history();
        let total_runs = history.len();
        let successful_runs = history
            .iter()
            .filter(|entry| entry.findings.is_empty())
            .count();
        let total_mistakes: usize = history.iter().map(|entry| entry.findings.len()).sum();

        let improvement_rate = if total_runs >= 10 {
            let mistakes_in = |skip: usize, take: usize| -> i64 {
                history
                    .iter()
                    .skip(skip)
                    .take(take)
                    .map(|entry| entry.findings.len() as i64)
                    .sum()
            };
            let recent = mistakes_in(total_runs - 5, 5);
            let previous = mistakes_in(total_runs - 10, 5);
            let rate = (previous - recent) as f64 / previous.max(1) as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        } else {
            0.0
        };

        let pattern_counts = self
            .memory
            .document()
            .patterns
            .iter()
            .map(|(key, record)| (key.to_string(), record.occurrence_count))
            .collect();

        LearningStatistics {
            total_runs,
            successful_runs,
            total_mistakes,
            learned_constraints: self.memory.constraints().len(),
            improvement_rate,
            pattern_counts,
        }
    }
}
