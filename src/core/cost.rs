//! ST-062: Cost estimation seam.
//!
//! Estimates are advisory. The orchestrator logs estimator failures and
//! carries on; no plan or apply is ever aborted over cost.

use super::synth::Ir;
use serde::Serialize;
use std::collections::BTreeMap;

/// Monthly cost estimate for one template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub currency: String,
    pub monthly_total: f64,
    /// Per resource type
    pub breakdown: BTreeMap<String, f64>,
}

/// Pluggable estimator run after a successful plan.
pub trait CostEstimator: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the estimator has nothing to say.
    fn estimate(&self, ir: &Ir) -> Result<Option<CostEstimate>, String>;
}

/// Default: no estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCostEstimate;

impl CostEstimator for NoCostEstimate {
    fn name(&self) -> &str {
        "none"
    }

    fn estimate(&self, _ir: &Ir) -> Result<Option<CostEstimate>, String> {
        Ok(None)
    }
}

/// Run `estimator`, downgrading failures to a warning.
pub fn estimate_or_warn(estimator: &dyn CostEstimator, ir: &Ir) -> Option<CostEstimate> {
    match estimator.estimate(ir) {
        Ok(estimate) => estimate,
        Err(e) => {
            tracing::warn!(estimator = estimator.name(), template = ir.template(), error = %e, "cost estimation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::ResourceGraph;
    use crate::core::synth::{synthesize, SynthOptions};

    struct Broken;

    impl CostEstimator for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn estimate(&self, _ir: &Ir) -> Result<Option<CostEstimate>, String> {
            Err("pricing API unreachable".into())
        }
    }

    fn empty_ir() -> Ir {
        synthesize(&ResourceGraph::new(), "t", &SynthOptions::default()).unwrap()
    }

    #[test]
    fn test_st062_default_has_no_estimate() {
        assert!(estimate_or_warn(&NoCostEstimate, &empty_ir()).is_none());
    }

    #[test]
    fn test_st062_failure_is_not_fatal() {
        assert!(estimate_or_warn(&Broken, &empty_ir()).is_none());
    }
}
