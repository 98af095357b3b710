//! Demo experiment: gradient descent on f(x) = x².
//!
//! Hyperparameters (all optional):
//! - `x0`: starting point (default 8.0)
//! - `lr`: learning rate (default 0.1)
//! - `epochs`: epoch budget (default 3); the experiment asks to pause once
//!   it is spent
//! - `steps_per_epoch`: steps per epoch (default 25)
//!
//! Build as a cdylib and hand the artifact's path to `dlexd` as the
//! experiment definition.

use dlexd::experiment::{Experiment, StepError, StepOutcome};
use serde_json::{Value, json};

struct Quadratic {
    x: f64,
    lr: f64,
    epoch: u64,
    epoch_budget: u64,
    steps_per_epoch: u64,
    step_in_epoch: u64,
}

impl Quadratic {
    fn new(hyperparams: &Value) -> Self {
        let param = |name: &str, default: f64| {
            hyperparams.get(name).and_then(Value::as_f64).unwrap_or(default)
        };
        Self {
            x: param("x0", 8.0),
            lr: param("lr", 0.1),
            epoch: 0,
            epoch_budget: param("epochs", 3.0) as u64,
            steps_per_epoch: param("steps_per_epoch", 25.0) as u64,
            step_in_epoch: 0,
        }
    }
}

impl Experiment for Quadratic {
    fn step(&mut self) -> Result<StepOutcome, StepError> {
        // d/dx x² = 2x
        self.x -= self.lr * 2.0 * self.x;
        if !self.x.is_finite() {
            return Err(StepError::new(format!(
                "diverged at x = {} (lr {} too large)",
                self.x, self.lr
            )));
        }

        self.step_in_epoch += 1;
        if self.step_in_epoch == self.steps_per_epoch {
            self.step_in_epoch = 0;
            self.epoch += 1;
            return Ok(StepOutcome::EpochBoundary);
        }
        Ok(StepOutcome::Advanced)
    }

    fn loss(&self) -> f64 {
        self.x * self.x
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn position(&self) -> Value {
        json!(self.step_in_epoch)
    }

    fn is_done(&self) -> bool {
        self.loss() < 1e-12
    }

    fn should_pause(&self) -> bool {
        self.epoch >= self.epoch_budget && !self.is_done()
    }
}

fn create(hyperparams: &Value) -> Box<dyn Experiment> {
    Box::new(Quadratic::new(hyperparams))
}

dlexd::declare_experiment!(create);
