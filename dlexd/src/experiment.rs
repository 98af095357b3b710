//! The experiment capability contract and its shared-library loader.
//!
//! User training code is compiled to a `cdylib` that exports one
//! [`ExperimentDecl`] under the `dlex_experiment` symbol (use
//! [`declare_experiment!`]). The runner loads the library, injects the
//! hyperparameters through the declared constructor, and drives the returned
//! [`Experiment`] one step at a time.
//!
//! Plugins must be built against the same dlexd version and toolchain as the
//! runner that loads them; the declaration carries an ABI version so a
//! mismatched artifact fails the load instead of corrupting the process.

use std::path::Path;

use libloading::Library;
use serde_json::Value;

/// ABI version stamped into every [`ExperimentDecl`].
pub const EXPERIMENT_ABI_VERSION: u32 = 1;

/// Exported symbol the loader resolves.
pub const EXPERIMENT_ENTRYPOINT: &[u8] = b"dlex_experiment\0";

/// What one training step did to the experiment's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced,
    /// The step crossed an epoch boundary; the runner re-reports the epoch.
    EpochBoundary,
}

#[derive(Debug, thiserror::Error)]
#[error("training step failed: {0}")]
pub struct StepError(pub String);

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One running training experiment.
///
/// Implementations are constructed by the plugin's declared constructor with
/// the hyperparameters already injected, so the contract itself carries no
/// configuration.
pub trait Experiment: Send {
    /// Advances training by one step.
    fn step(&mut self) -> Result<StepOutcome, StepError>;

    fn loss(&self) -> f64;

    fn epoch(&self) -> u64;

    /// Opaque position within the current epoch (batch index, sample offset,
    /// whatever the experiment counts in).
    fn position(&self) -> Value;

    fn is_done(&self) -> bool;

    /// Pause-eligibility: `true` asks the runner to hold before the next
    /// step, e.g. when the configured epoch budget is spent.
    fn should_pause(&self) -> bool {
        false
    }
}

/// Constructor signature a plugin declares: hyperparameters in, experiment
/// out.
pub type ExperimentCtor = fn(hyperparams: &Value) -> Box<dyn Experiment>;

/// The static a plugin exports under [`EXPERIMENT_ENTRYPOINT`].
#[repr(C)]
pub struct ExperimentDecl {
    pub abi_version: u32,
    pub create: ExperimentCtor,
}

/// Declares the experiment a `cdylib` provides.
///
/// ```ignore
/// fn create(hyperparams: &serde_json::Value) -> Box<dyn dlexd::Experiment> {
///     Box::new(MyExperiment::new(hyperparams))
/// }
///
/// dlexd::declare_experiment!(create);
/// ```
#[macro_export]
macro_rules! declare_experiment {
    ($ctor:path) => {
        #[unsafe(no_mangle)]
        #[allow(non_upper_case_globals)]
        pub static dlex_experiment: $crate::experiment::ExperimentDecl =
            $crate::experiment::ExperimentDecl {
                abi_version: $crate::experiment::EXPERIMENT_ABI_VERSION,
                create: $ctor,
            };
    };
}

/// The sole expected failure mode of the runner's `Loading` state: the
/// definition at the given path does not yield a usable experiment.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to open definition library: {0}")]
    Open(libloading::Error),

    #[error("definition does not declare an experiment (missing `dlex_experiment` symbol)")]
    NoExperiment(libloading::Error),

    #[error("definition ABI version {found} does not match {expected}")]
    AbiMismatch { expected: u32, found: u32 },
}

/// A loaded definition: keeps the library mapped for as long as the
/// constructor (and anything it creates) may run.
#[derive(Debug)]
pub struct LoadedDefinition {
    create: ExperimentCtor,
    _library: Library,
}

impl LoadedDefinition {
    /// Loads the definition library at `path` and resolves its declaration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();

        // Safety: loading a definition executes its initializers; experiment
        // artifacts are trusted user code by the system's threat model.
        let library = unsafe { Library::new(path) }.map_err(LoadError::Open)?;

        let decl = unsafe {
            let symbol = library
                .get::<*const ExperimentDecl>(EXPERIMENT_ENTRYPOINT)
                .map_err(LoadError::NoExperiment)?;
            &**symbol
        };

        if decl.abi_version != EXPERIMENT_ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                expected: EXPERIMENT_ABI_VERSION,
                found: decl.abi_version,
            });
        }

        tracing::debug!(path = %path.display(), "definition loaded");
        Ok(Self {
            create: decl.create,
            _library: library,
        })
    }

    /// Instantiates the experiment with its hyperparameters injected.
    pub fn instantiate(&self, hyperparams: &Value) -> Box<dyn Experiment> {
        (self.create)(hyperparams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_load_error() {
        let err = LoadedDefinition::load("/nonexistent/definition.so").unwrap_err();
        assert!(matches!(err, LoadError::Open(_)));
    }

    #[test]
    fn non_library_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("definition.so");
        std::fs::write(&path, b"not an object file").unwrap();

        let err = LoadedDefinition::load(&path).unwrap_err();
        assert!(matches!(err, LoadError::Open(_)));
    }

    #[test]
    fn default_pause_eligibility_is_false() {
        struct Fixed;
        impl Experiment for Fixed {
            fn step(&mut self) -> Result<StepOutcome, StepError> {
                Ok(StepOutcome::Advanced)
            }
            fn loss(&self) -> f64 {
                0.0
            }
            fn epoch(&self) -> u64 {
                0
            }
            fn position(&self) -> Value {
                Value::Null
            }
            fn is_done(&self) -> bool {
                true
            }
        }

        assert!(!Fixed.should_pause());
    }
}
