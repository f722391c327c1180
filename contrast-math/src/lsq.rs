//! Levenberg-Marquardt nonlinear least squares.
//!
//! Minimizes `0.5 * |r(p)|^2` for a residual vector `r` over the parameter
//! vector `p`. Each iteration solves the damped normal equations
//!
//! ```text
//! (J^T J + lambda * (I + diag(J^T J))) * step = -J^T r
//! ```
//!
//! with a Cholesky factorization, shrinking `lambda` after accepted steps and
//! growing it after rejected ones. The identity term keeps the system
//! positive definite when the Jacobian is rank deficient, which happens
//! whenever a model has more parameters than distinct data points.
//!
//! Termination follows the usual three tests: relative cost reduction
//! (`ftol`), step size relative to the parameter norm (`xtol`) and the
//! infinity norm of the gradient (`gtol`), plus an absolute cost floor
//! (`cost_tol`). Models whose best fit lies along a flat valley creep with
//! steady but negligible cost reductions; a run of `stall_window` accepted
//! steps that together lower the cost by no more than `stall_tol` (relative)
//! ends the fit as stalled. Hitting the iteration cap, damping blow-up or a
//! non-finite cost is reported as an error carrying the last estimate, never
//! as a silently accepted fit.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// A least squares problem: residuals and (optionally) their Jacobian.
pub trait LeastSquaresProblem {
    /// Residual vector at `params`.
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of the residuals, one row per residual, one column per parameter.
    ///
    /// Defaults to central finite differences.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let base = self.residuals(params);
        let mut jacobian = DMatrix::zeros(base.len(), params.len());

        for col in 0..params.len() {
            let h = 1e-7 * (1.0 + params[col].abs());
            let mut forward = params.clone();
            let mut backward = params.clone();
            forward[col] += h;
            backward[col] -= h;

            let derivative = (self.residuals(&forward) - self.residuals(&backward)) / (2.0 * h);
            jacobian.set_column(col, &derivative);
        }

        jacobian
    }
}

/// Solver settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LsqOptions {
    /// Maximum number of Jacobian evaluations
    pub max_iterations: usize,
    /// Relative cost reduction below which an accepted step terminates
    pub ftol: f64,
    /// Relative step size below which the solver terminates
    pub xtol: f64,
    /// Gradient infinity norm below which the solver terminates
    pub gtol: f64,
    /// Starting damping factor
    pub initial_damping: f64,
    /// Cost at or below which the current estimate is accepted
    pub cost_tol: f64,
    /// Accepted steps per stall check; 0 disables the check
    pub stall_window: usize,
    /// Relative cost reduction over a stall window below which the fit has stalled
    pub stall_tol: f64,
}

impl Default for LsqOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-14,
            initial_damping: 1e-3,
            cost_tol: 0.0,
            stall_window: 10,
            stall_tol: 1e-2,
        }
    }
}

/// Which test ended a converged fit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    CostFloor,
    CostReduction,
    StepSize,
    Gradient,
    Stalled,
}

/// Result of a converged fit
#[derive(Debug, Clone)]
pub struct LsqReport {
    /// Best-fit parameters
    pub params: DVector<f64>,
    /// Final cost, `0.5 * sum(r^2)`
    pub cost: f64,
    /// Number of iterations performed
    pub iterations: usize,
    pub termination: Termination,
}

/// Failure modes of [`levenberg_marquardt`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LsqError {
    #[error("no convergence after {iterations} iterations (cost {cost:e})")]
    NotConverged {
        params: Vec<f64>,
        cost: f64,
        iterations: usize,
    },

    #[error("non-finite cost after {iterations} iterations")]
    NonFinite {
        params: Vec<f64>,
        cost: f64,
        iterations: usize,
    },

    #[error("problem has no residuals")]
    NoResiduals,
}

const MAX_DAMPING: f64 = 1e20;

/// Minimize `problem` starting from `initial`.
pub fn levenberg_marquardt<P: LeastSquaresProblem>(
    problem: &P,
    initial: DVector<f64>,
    options: &LsqOptions,
) -> Result<LsqReport, LsqError> {
    let mut params = initial;
    let mut residuals = problem.residuals(&params);
    if residuals.is_empty() {
        return Err(LsqError::NoResiduals);
    }

    let mut cost = 0.5 * residuals.norm_squared();
    if !cost.is_finite() {
        return Err(LsqError::NonFinite {
            params: params.iter().copied().collect(),
            cost,
            iterations: 0,
        });
    }

    let n = params.len();
    let mut damping = options.initial_damping;
    let mut window_cost = cost;
    let mut window_steps = 0;

    for iteration in 1..=options.max_iterations {
        if cost <= options.cost_tol {
            return Ok(LsqReport {
                params,
                cost,
                iterations: iteration - 1,
                termination: Termination::CostFloor,
            });
        }

        let jacobian = problem.jacobian(&params);
        let gradient = jacobian.transpose() * &residuals;
        if !gradient.iter().all(|g| g.is_finite()) {
            return Err(LsqError::NonFinite {
                params: params.iter().copied().collect(),
                cost,
                iterations: iteration,
            });
        }
        if gradient.amax() <= options.gtol {
            return Ok(LsqReport {
                params,
                cost,
                iterations: iteration,
                termination: Termination::Gradient,
            });
        }

        let normal = jacobian.transpose() * &jacobian;
        let neg_gradient = -gradient.clone();

        loop {
            let mut damped = normal.clone();
            for i in 0..n {
                damped[(i, i)] += damping * (1.0 + normal[(i, i)]);
            }

            let Some(factor) = damped.cholesky() else {
                damping *= 10.0;
                if damping > MAX_DAMPING {
                    break;
                }
                continue;
            };

            let step = factor.solve(&neg_gradient);
            let step_small = step.norm() <= options.xtol * (params.norm() + options.xtol);
            let candidate = &params + &step;
            let candidate_residuals = problem.residuals(&candidate);
            let candidate_cost = 0.5 * candidate_residuals.norm_squared();

            if candidate_cost.is_finite() && candidate_cost < cost {
                let reduction = (cost - candidate_cost) / cost;
                params = candidate;
                residuals = candidate_residuals;
                cost = candidate_cost;
                damping = (damping / 10.0).max(1e-15);

                let termination = if cost <= options.cost_tol {
                    Some(Termination::CostFloor)
                } else if reduction <= options.ftol {
                    Some(Termination::CostReduction)
                } else if step_small {
                    Some(Termination::StepSize)
                } else {
                    window_steps += 1;
                    if options.stall_window > 0 && window_steps >= options.stall_window {
                        let window_reduction = (window_cost - cost) / window_cost;
                        window_cost = cost;
                        window_steps = 0;
                        (window_reduction <= options.stall_tol).then_some(Termination::Stalled)
                    } else {
                        None
                    }
                };

                if let Some(termination) = termination {
                    return Ok(LsqReport {
                        params,
                        cost,
                        iterations: iteration,
                        termination,
                    });
                }
                break;
            }

            // Rejected: no further progress is possible at this precision
            if step_small {
                return Ok(LsqReport {
                    params,
                    cost,
                    iterations: iteration,
                    termination: Termination::StepSize,
                });
            }

            damping *= 10.0;
            if damping > MAX_DAMPING {
                break;
            }
        }

        if damping > MAX_DAMPING {
            return Err(LsqError::NotConverged {
                params: params.iter().copied().collect(),
                cost,
                iterations: iteration,
            });
        }
    }

    Err(LsqError::NotConverged {
        params: params.iter().copied().collect(),
        cost,
        iterations: options.max_iterations,
    })
}
