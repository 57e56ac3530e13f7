#![forbid(unsafe_code)]

use lesson_loop_domain::{ExecutionTrace, LessonError, MistakeFinding, MistakeKind};
use serde::{Deserialize, Serialize};

/// An ordering constraint over a pair of tools: when both appear in a trace,
/// `earlier`'s first occurrence must precede `later`'s first occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OrderingPair {
    pub earlier: String,
    pub later: String,
}

/// Declarative rule configuration for the evaluator. Domain knowledge lives
/// here, not in the rule logic: the required toolset, a partial order over
/// tool pairs, the minimum call count before an answer, and the refusal
/// phrases used by the lexical ignored-output heuristic.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EvaluationRules {
    /// Tools the agent is allowed to reference. Empty disables the
    /// unknown-tool boundary check.
    #[serde(default)]
    pub known_tools: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub ordering: Vec<OrderingPair>,
    pub min_tool_calls: usize,
    #[serde(default)]
    pub refusal_phrases: Vec<String>,
}

impl EvaluationRules {
    /// Rules for the travel-planning toolset: weather first, then flights,
    /// hotels, and the itinerary last.
    #[must_use]
    pub fn travel_planning() -> Self {
        let sequence = [
            "check_weather",
            "search_flights",
            "recommend_hotels",
            "create_itinerary",
        ];

        let mut ordering = Vec::new();
        for (i, earlier) in sequence.iter().enumerate() {
            for later in &sequence[i + 1..] {
                ordering.push(OrderingPair {
                    earlier: (*earlier).to_string(),
                    later: (*later).to_string(),
                });
            }
        }

        Self {
            known_tools: sequence.iter().map(|tool| (*tool).to_string()).collect(),
            required_tools: vec!["check_weather".to_string()],
            ordering,
            min_tool_calls: 2,
            refusal_phrases: vec![
                "i cannot".to_string(),
                "i don't have access".to_string(),
                "i'm unable to".to_string(),
                "i can't help".to_string(),
            ],
        }
    }

    /// Validates the rule configuration.
    ///
    /// # Errors
    /// Returns [`LessonError::Configuration`] when tool names are empty,
    /// ordering pairs are degenerate or reference unknown tools, or
    /// `min_tool_calls` is zero.
    pub fn validate(&self) -> Result<(), LessonError> {
        if self.min_tool_calls == 0 {
            return Err(LessonError::Configuration(
                "min_tool_calls MUST be >= 1".to_string(),
            ));
        }

        for tool in self
            .known_tools
            .iter()
            .chain(&self.required_tools)
            .chain(self.ordering.iter().map(|pair| &pair.earlier))
            .chain(self.ordering.iter().map(|pair| &pair.later))
        {
            if tool.trim().is_empty() {
                return Err(LessonError::Configuration(
                    "tool names MUST be non-empty".to_string(),
                ));
            }
        }

        for pair in &self.ordering {
            if pair.earlier == pair.later {
                return Err(LessonError::Configuration(format!(
                    "ordering pair '{}' MUST name two distinct tools",
                    pair.earlier
                )));
            }
        }

        if !self.known_tools.is_empty() {
            for tool in self
                .required_tools
                .iter()
                .chain(self.ordering.iter().map(|pair| &pair.earlier))
                .chain(self.ordering.iter().map(|pair| &pair.later))
            {
                if !self.known_tools.contains(tool) {
                    return Err(LessonError::Configuration(format!(
                        "rule references tool '{tool}' missing from known_tools"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Boundary check for a trace supplied by the external agent.
    ///
    /// # Errors
    /// Returns [`LessonError::Validation`] when a tool call names an unknown
    /// tool or `step_index` values do not match call order.
    pub fn validate_trace(&self, trace: &ExecutionTrace) -> Result<(), LessonError> {
        for (position, call) in trace.tool_calls.iter().enumerate() {
            if !self.known_tools.is_empty() && !self.known_tools.contains(&call.tool) {
                return Err(LessonError::Validation(format!(
                    "tool call {position} references unknown tool '{}'",
                    call.tool
                )));
            }
            if call.step_index != position {
                return Err(LessonError::Validation(format!(
                    "tool call {position} carries step_index {}, expected {position}",
                    call.step_index
                )));
            }
        }
        Ok(())
    }

    /// Applies every mistake rule to a trace. Pure and deterministic: the
    /// same trace always yields the same findings, and no rule touches
    /// memory. A trace may trigger zero, one, or several findings.
    #[must_use]
    pub fn evaluate(&self, trace: &ExecutionTrace) -> Vec<MistakeFinding> {
        let mut findings = Vec::new();
        for rule in RULES {
            rule(self, trace, &mut findings);
        }
        findings
    }
}

type Rule = fn(&EvaluationRules, &ExecutionTrace, &mut Vec<MistakeFinding>);

/// Rules are independent and uniform so individual heuristics (notably the
/// lexical refusal matcher) can be replaced without touching the pipeline.
const RULES: &[Rule] = &[
    check_missing_required_tools,
    check_tool_sequence,
    check_early_answer,
    check_ignored_tool_output,
];

fn check_missing_required_tools(
    rules: &EvaluationRules,
    trace: &ExecutionTrace,
    findings: &mut Vec<MistakeFinding>,
) {
    for required in &rules.required_tools {
        if !trace.tool_calls.iter().any(|call| &call.tool == required) {
            findings.push(MistakeFinding {
                kind: MistakeKind::MissingRequiredTool,
                detail: format!("required tool '{required}' was not used"),
                step_index: None,
            });
        }
    }
}

fn check_tool_sequence(
    rules: &EvaluationRules,
    trace: &ExecutionTrace,
    findings: &mut Vec<MistakeFinding>,
) {
    for pair in &rules.ordering {
        let earlier_first = first_occurrence(trace, &pair.earlier);
        let later_first = first_occurrence(trace, &pair.later);
        // First occurrences only; repeat calls never add findings for a pair.
        if let (Some(earlier_idx), Some(later_idx)) = (earlier_first, later_first) {
            if later_idx < earlier_idx {
                findings.push(MistakeFinding {
                    kind: MistakeKind::WrongSequence,
                    detail: format!("'{}' was called before '{}'", pair.later, pair.earlier),
                    step_index: Some(later_idx),
                });
            }
        }
    }
}

fn check_early_answer(
    rules: &EvaluationRules,
    trace: &ExecutionTrace,
    findings: &mut Vec<MistakeFinding>,
) {
    let calls = trace.tool_calls.len();
    if !trace.final_answer.is_empty() && calls < rules.min_tool_calls {
        findings.push(MistakeFinding {
            kind: MistakeKind::TooEarlyAnswer,
            detail: format!("final answer was given after only {calls} tool calls"),
            step_index: Some(calls),
        });
    }
}

fn check_ignored_tool_output(
    rules: &EvaluationRules,
    trace: &ExecutionTrace,
    findings: &mut Vec<MistakeFinding>,
) {
    if trace.tool_calls.is_empty() || trace.final_answer.is_empty() {
        return;
    }

    let answer = trace.final_answer.to_ascii_lowercase();
    let refused = rules
        .refusal_phrases
        .iter()
        .any(|phrase| answer.contains(&phrase.to_ascii_lowercase()));

    if refused {
        findings.push(MistakeFinding {
            kind: MistakeKind::IgnoredToolOutput,
            detail: "tool outputs were ignored in favor of a generic refusal".to_string(),
            step_index: None,
        });
    }
}

fn first_occurrence(trace: &ExecutionTrace, tool: &str) -> Option<usize> {
    trace.tool_calls.iter().position(|call| call.tool == tool)
}
