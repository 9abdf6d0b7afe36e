use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SolveOutcome, TrajectoryProblem, TrajectorySolver};
use crate::error::ControlResult;

const IMPROVEMENT_EPS: f64 = 1e-12;

/// Derivative-free compass search.
///
/// Polls each coordinate and a uniform shift of the whole trajectory at
/// `±step`, accepting the first strict improvement. When a full sweep finds
/// nothing the step halves. The search is deterministic, so a seed that is
/// already stationary comes back unchanged.
///
/// A warm-started problem is only refined locally: polling starts at
/// `warm_start_step` and a move must gain at least `warm_start_min_gain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSearch {
    pub initial_step: f64,
    pub min_step: f64,
    pub max_evaluations: usize,
    pub warm_start_step: f64,
    pub warm_start_min_gain: f64,
}

impl Default for PatternSearch {
    fn default() -> Self {
        Self {
            initial_step: 0.25,
            min_step: 1e-3,
            max_evaluations: 20_000,
            warm_start_step: 4e-3,
            warm_start_min_gain: 1e-4,
        }
    }
}

impl PatternSearch {
    fn poll(x: &[f64], direction: usize, delta: f64) -> Vec<f64> {
        let mut candidate = x.to_vec();
        if direction < x.len() {
            candidate[direction] += delta;
        } else {
            candidate.iter_mut().for_each(|v| *v += delta);
        }
        candidate
    }
}

impl TrajectorySolver for PatternSearch {
    fn name(&self) -> &str {
        "pattern_search"
    }

    fn solve(&self, problem: &dyn TrajectoryProblem) -> ControlResult<SolveOutcome> {
        let mut x = problem.seed();
        problem.project(&mut x);
        let mut merit = problem.merit(&x)?;
        let mut evaluations = 1;
        if !merit.is_finite() {
            return Ok(SolveOutcome {
                solution: x,
                merit,
                evaluations,
                converged: false,
            });
        }

        let n = problem.dimension();
        let directions = if n > 1 { n + 1 } else { n };
        let (mut step, min_gain) = if problem.warm_started() {
            (
                self.warm_start_step.min(self.initial_step),
                self.warm_start_min_gain.max(IMPROVEMENT_EPS),
            )
        } else {
            (self.initial_step, IMPROVEMENT_EPS)
        };
        while step >= self.min_step {
            let mut improved = false;
            for direction in 0..directions {
                for delta in [step, -step] {
                    let mut candidate = Self::poll(&x, direction, delta);
                    problem.project(&mut candidate);
                    if candidate == x {
                        continue;
                    }
                    if evaluations >= self.max_evaluations {
                        debug!(evaluations, step, "evaluation budget exhausted");
                        return Ok(SolveOutcome {
                            solution: x,
                            merit,
                            evaluations,
                            converged: false,
                        });
                    }
                    let value = problem.merit(&candidate)?;
                    evaluations += 1;
                    if !value.is_finite() {
                        return Ok(SolveOutcome {
                            solution: x,
                            merit: value,
                            evaluations,
                            converged: false,
                        });
                    }
                    if value < merit - min_gain {
                        x = candidate;
                        merit = value;
                        improved = true;
                        break;
                    }
                }
            }
            if !improved {
                step *= 0.5;
            }
        }

        Ok(SolveOutcome {
            solution: x,
            merit,
            evaluations,
            converged: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::ConstraintReport;

    /// Separable quadratic on the unit box.
    struct Bowl {
        target: Vec<f64>,
        seed: Vec<f64>,
        warm: bool,
    }

    impl Bowl {
        fn cold(target: Vec<f64>, seed: Vec<f64>) -> Self {
            Self {
                target,
                seed,
                warm: false,
            }
        }
    }

    impl TrajectoryProblem for Bowl {
        fn dimension(&self) -> usize {
            self.target.len()
        }
        fn seed(&self) -> Vec<f64> {
            self.seed.clone()
        }
        fn project(&self, x: &mut [f64]) {
            x.iter_mut().for_each(|v| *v = v.clamp(0.0, 1.0));
        }
        fn merit(&self, x: &[f64]) -> ControlResult<f64> {
            Ok(x.iter().zip(&self.target).map(|(a, b)| (a - b).powi(2)).sum())
        }
        fn constraints(&self, _x: &[f64]) -> ControlResult<ConstraintReport> {
            Ok(ConstraintReport::default())
        }
        fn warm_started(&self) -> bool {
            self.warm
        }
    }

    #[test]
    fn test_finds_interior_minimum() {
        let problem = Bowl::cold(vec![0.3, 0.7, 0.55], vec![0.0; 3]);
        let out = PatternSearch::default().solve(&problem).unwrap();
        assert!(out.converged);
        for (x, t) in out.solution.iter().zip(&problem.target) {
            assert!((x - t).abs() < 2e-3);
        }
    }

    #[test]
    fn test_respects_bounds() {
        let problem = Bowl::cold(vec![1.4, -0.2], vec![0.5, 0.5]);
        let out = PatternSearch::default().solve(&problem).unwrap();
        assert!((out.solution[0] - 1.0).abs() < 1e-12);
        assert!(out.solution[1].abs() < 1e-12);
    }

    #[test]
    fn test_stationary_seed_is_returned_unchanged() {
        let problem = Bowl::cold(vec![0.25, 0.5], vec![0.25, 0.5]);
        let out = PatternSearch::default().solve(&problem).unwrap();
        assert_eq!(out.solution, vec![0.25, 0.5]);
    }

    #[test]
    fn test_budget_exhaustion_is_not_converged() {
        let problem = Bowl::cold(vec![0.3; 8], vec![0.0; 8]);
        let solver = PatternSearch {
            max_evaluations: 5,
            ..Default::default()
        };
        let out = solver.solve(&problem).unwrap();
        assert!(!out.converged);
        assert!(out.evaluations <= 5);
    }

    #[test]
    fn test_warm_seed_ignores_marginal_gains() {
        // (0.005)^2 below the warm-start gain threshold
        let problem = Bowl {
            target: vec![0.3, 0.6],
            seed: vec![0.305, 0.6],
            warm: true,
        };
        let out = PatternSearch::default().solve(&problem).unwrap();
        assert!(out.converged);
        assert_eq!(out.solution, vec![0.305, 0.6]);

        let cold = PatternSearch::default()
            .solve(&Bowl::cold(problem.target.clone(), problem.seed.clone()))
            .unwrap();
        assert!((cold.solution[0] - 0.3).abs() < 2e-3);
    }

    #[test]
    fn test_warm_seed_still_walks_toward_real_gains() {
        let problem = Bowl {
            target: vec![0.5],
            seed: vec![0.2],
            warm: true,
        };
        let out = PatternSearch::default().solve(&problem).unwrap();
        assert!(out.converged);
        assert!((out.solution[0] - 0.5).abs() < 0.02, "{:?}", out.solution);
    }
}
