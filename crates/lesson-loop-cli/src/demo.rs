//! Scripted demonstration of the learning curve. Stands in for the external
//! LLM-driven agent: the same procedural mistakes recur early on, constraints
//! get synthesized, and the later runs follow the recommended sequence.

use anyhow::Result;
use lesson_loop_domain::ExecutionTrace;
use lesson_loop_memory::StoreBackend;
use lesson_loop_orchestrator::LearningOrchestrator;

pub const SCRIPT_LEN: usize = 8;

const TASKS: [&str; 5] = [
    "Plan a 5-day trip to Paris from New York",
    "Plan a 4-day trip to Tokyo from Los Angeles",
    "Plan a week in London from Boston",
    "Plan a 3-day trip to Dubai from Miami",
    "Plan a 6-day trip to Sydney from San Francisco",
];

fn scripted_trace(run_index: usize) -> ExecutionTrace {
    let task = TASKS[run_index % TASKS.len()];
    match run_index {
        // Skips the required weather check and answers after one call.
        0 | 1 => ExecutionTrace::new(task)
            .with_tool_calls(&["search_flights"])
            .with_final_answer("Take the morning SkyHigh flight."),
        // Recommends hotels before searching flights.
        2 | 3 => ExecutionTrace::new(task)
            .with_tool_calls(&[
                "check_weather",
                "recommend_hotels",
                "search_flights",
                "create_itinerary",
            ])
            .with_final_answer("Stay at the Grand Hotel; flights from $200."),
        // Calls tools but answers with a refusal.
        4 => ExecutionTrace::new(task)
            .with_tool_calls(&["check_weather", "search_flights"])
            .with_final_answer("I cannot help with travel planning."),
        // Converged on the recommended sequence.
        _ => ExecutionTrace::new(task)
            .with_tool_calls(&[
                "check_weather",
                "search_flights",
                "recommend_hotels",
                "create_itinerary",
            ])
            .with_final_answer(
                "Day 1: arrive and check in. Day 2: sights. Weather is mild; \
                 flights from $200, Grand Hotel recommended.",
            ),
    }
}

pub fn run<B: StoreBackend>(
    orchestrator: &mut LearningOrchestrator<B>,
    runs: usize,
) -> Result<()> {
    for run_index in 0..runs {
        let injected = orchestrator.active_constraints();
        println!(
            "--- run {}/{runs} (constraints injected: {}) ---",
            run_index + 1,
            injected.len()
        );
        for constraint in &injected {
            println!("  inject: {}", constraint.text);
        }

        let trace = scripted_trace(run_index);
        println!("task: {}", trace.task);
        let report = orchestrator.record_run(&trace)?;
        super::print_report(&report);
    }

    let stats = orchestrator.statistics();
    println!(
        "--- summary: runs={} successful={} mistakes={} constraints={} improvement={}% ---",
        stats.total_runs,
        stats.successful_runs,
        stats.total_mistakes,
        stats.learned_constraints,
        stats.improvement_rate
    );
    Ok(())
}
