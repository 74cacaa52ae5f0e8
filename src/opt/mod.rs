//! Optimisation passes and the pipeline that drives them.
//!
//! Passes operate on a whole module and can be composed into pipelines.
//! Each pass implements the [`Pass`] trait; the pipeline repeats its pass
//! list until a full sweep makes no change (or an iteration cap trips), then
//! reports statistics. The verifier runs after every pass that changed
//! something, so invariant breakage is attributed to the pass that caused it.

mod cse;
mod dce;
mod inline;
mod mem2reg;
mod sccp;
mod tail_call;

pub use cse::CommonSubexpressionElimination;
pub use dce::DeadCodeElimination;
pub use inline::Inline;
pub use mem2reg::PromoteAllocas;
pub use sccp::SparseConditionalConstants;
pub use tail_call::TailCallMarking;

use log::debug;

use crate::error::{BasaltError, Result};
use crate::ir::module::Module;
use crate::ir::verifier::verify_module;

/// Trait for module-level optimisation passes.
///
/// `run` returns `Ok(changed)`; an `Err` is a refusal or failure that the
/// driver decides to tolerate or abort on.
pub trait Pass {
    /// Unique name for this pass.
    fn name(&self) -> &'static str;

    /// Description of what this pass does.
    fn description(&self) -> &'static str;

    /// Apply the pass. Returns true if any change was made.
    fn run(&mut self, module: &mut Module) -> std::result::Result<bool, String>;
}

/// Statistics about a pipeline run.
#[derive(Debug, Default)]
pub struct PassStats {
    /// Number of pass invocations.
    pub passes_run: usize,
    /// Number of invocations that changed the module.
    pub passes_changed: usize,
    /// Number of full sweeps over the pass list.
    pub sweeps: usize,
}

/// A fixpoint-driven pipeline of passes.
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
    /// Cap on full sweeps; hitting it is an internal error.
    max_sweeps: usize,
    dump: bool,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            max_sweeps: 20,
            dump: false,
        }
    }

    /// Print the IR to stderr after every pass that changes it.
    pub fn dump_after_each_pass(mut self) -> Self {
        self.dump = true;
        self
    }

    pub fn add_pass<P: Pass + 'static>(mut self, pass: P) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Default pipeline for an optimisation level.
    ///
    /// - `-O0`: nothing
    /// - `-O1`: promotion, constants, dead-code removal
    /// - `-O2`: adds inlining, value numbering and tail-call marking
    /// - `-O3`: same passes with a larger inline threshold
    pub fn default_for_opt_level(opt_level: u8, inline_threshold: Option<u32>) -> Self {
        let mut pipeline = Self::new();
        if opt_level == 0 {
            return pipeline;
        }

        pipeline = pipeline.add_pass(PromoteAllocas);
        if opt_level >= 2 {
            let threshold = inline_threshold.unwrap_or(if opt_level >= 3 { 120 } else { 40 });
            pipeline = pipeline.add_pass(Inline::with_threshold(threshold));
        }
        pipeline = pipeline.add_pass(SparseConditionalConstants);
        if opt_level >= 2 {
            pipeline = pipeline.add_pass(CommonSubexpressionElimination);
        }
        pipeline = pipeline.add_pass(DeadCodeElimination);
        if opt_level >= 2 {
            pipeline = pipeline.add_pass(TailCallMarking);
        }
        pipeline
    }

    /// Run the pipeline to a fixpoint.
    pub fn run(&mut self, module: &mut Module) -> Result<PassStats> {
        let mut stats = PassStats::default();
        loop {
            if stats.sweeps >= self.max_sweeps {
                return Err(BasaltError::InternalError(format!(
                    "optimisation pipeline did not converge after {} sweeps",
                    stats.sweeps
                )));
            }
            stats.sweeps += 1;
            let mut sweep_changed = false;
            for pass in &mut self.passes {
                stats.passes_run += 1;
                let changed = pass.run(module).map_err(|e| {
                    BasaltError::OptError(format!("pass '{}' failed: {}", pass.name(), e))
                })?;
                if changed {
                    debug!("pass {} changed the module", pass.name());
                    stats.passes_changed += 1;
                    sweep_changed = true;
                    verify_module(module).map_err(|e| {
                        BasaltError::InternalError(format!(
                            "IR broken after pass '{}': {}",
                            pass.name(),
                            e
                        ))
                    })?;
                    if self.dump {
                        eprintln!(
                            "; after {}\n{}",
                            pass.name(),
                            crate::ir::printer::print_module(module)
                        );
                    }
                }
            }
            if !sweep_changed {
                break;
            }
        }
        Ok(stats)
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl Default for PassPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn test_pipeline_empty() {
        let pipeline = PassPipeline::new();
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.len(), 0);
    }

    #[test]
    fn test_default_levels() {
        assert!(PassPipeline::default_for_opt_level(0, None).is_empty());
        let o1 = PassPipeline::default_for_opt_level(1, None);
        assert!(o1.pass_names().contains(&"promote-allocas"));
        assert!(!o1.pass_names().contains(&"inline"));
        let o2 = PassPipeline::default_for_opt_level(2, None);
        assert!(o2.pass_names().contains(&"inline"));
        assert!(o2.pass_names().contains(&"tail-call-marking"));
    }

    #[test]
    fn test_pipeline_reaches_fixpoint() {
        let input = r#"
            fn @f() -> i32 {
            entry:
              %a = add.i32 34, 35
              ret.i32 %a
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pipeline = PassPipeline::default_for_opt_level(2, None);
        let stats = pipeline.run(&mut module).unwrap();
        assert!(stats.passes_run > 0);
        // A second run is a no-op.
        let stats2 = pipeline.run(&mut module).unwrap();
        assert_eq!(stats2.passes_changed, 0);
    }
}
