use super::engine::run_single_simulation;
use super::random::ReturnGenerator;
use super::types::{BatchResult, EngineError, Progress, Scenario, SimulationStatus};

const PROGRESS_INTERVAL: u32 = 50;

/// Runs `monte_carlo.runs` independent simulations with seeds
/// `base_seed + run_index`, collecting final balances, depletion years,
/// the success count, and the full balance path of every run. Progress is
/// reported every `PROGRESS_INTERVAL` completed runs and on the final run.
/// The first failing run aborts the whole batch.
pub fn run_batch(
    scenario: &Scenario,
    mut progress: impl FnMut(Progress),
) -> Result<BatchResult, EngineError> {
    scenario.validate()?;

    let total_runs = scenario.monte_carlo.runs;
    let mut final_balances = Vec::with_capacity(total_runs as usize);
    let mut depletion_years = Vec::with_capacity(total_runs as usize);
    let mut simulation_paths = Vec::with_capacity(total_runs as usize);
    let mut success_count = 0;

    for run_index in 0..total_runs {
        let mut rng = ReturnGenerator::for_run(scenario.monte_carlo.base_seed, run_index);
        let result = run_single_simulation(scenario, Some(&mut rng)).map_err(|e| {
            EngineError::RunFailed {
                run_index,
                message: e.to_string(),
            }
        })?;

        let path: Vec<f64> = result.yearly_records.iter().map(|r| r.end_total).collect();
        let succeeded = result.status == SimulationStatus::Success;
        if succeeded {
            success_count += 1;
            final_balances.push(path.last().copied().unwrap_or(0.0));
        } else {
            final_balances.push(0.0);
        }
        depletion_years.push(result.depletion_year);
        simulation_paths.push(path);

        let completed_runs = run_index + 1;
        if completed_runs % PROGRESS_INTERVAL == 0 || completed_runs == total_runs {
            log::info!("completed {completed_runs}/{total_runs} runs");
            progress(Progress {
                completed_runs,
                total_runs,
            });
        }
    }

    Ok(BatchResult {
        final_balances,
        depletion_years,
        success_count,
        simulation_paths,
    })
}
