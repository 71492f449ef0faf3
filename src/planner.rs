//! Memoizes [`compiler::compile`] output by document identity (spec §4.2).
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::compiler::{self, plan::Plan};
use crate::error::Result;

/// What a caller may pass where a plan is expected: either a source string
/// to compile (and memoize), or an already-compiled plan to pass through
/// unchanged — the `kind == CachePlan` sentinel from spec §4.2.
pub enum PlanInput<'a> {
    Plan(Arc<Plan>),
    Source(&'a str),
}

impl<'a> From<&'a str> for PlanInput<'a> {
    fn from(source: &'a str) -> Self {
        PlanInput::Source(source)
    }
}

impl From<Arc<Plan>> for PlanInput<'static> {
    fn from(plan: Arc<Plan>) -> Self {
        PlanInput::Plan(plan)
    }
}

type CacheKey = (String, Option<String>);

/// Memoizes compiled plans by `(exact source text, fragment name)`. A cache
/// hit returns the exact same `Arc` as a previous call; a miss compiles and
/// stores the result. Compiler failures propagate and are never cached, so
/// a subsequent call retries compilation (spec §4.2).
#[derive(Default)]
pub struct Planner {
    cache: RefCell<HashMap<CacheKey, Arc<Plan>>>,
}

impl Planner {
    pub fn new() -> Self {
        Planner::default()
    }

    pub fn get_plan<'a>(
        &self,
        input: impl Into<PlanInput<'a>>,
        fragment_name: Option<&str>,
    ) -> Result<Arc<Plan>> {
        match input.into() {
            PlanInput::Plan(plan) => Ok(plan),
            PlanInput::Source(source) => {
                let key = (source.to_string(), fragment_name.map(str::to_string));
                if let Some(plan) = self.cache.borrow().get(&key) {
                    return Ok(plan.clone());
                }
                let plan = Arc::new(compiler::compile(source, fragment_name)?);
                self.cache.borrow_mut().insert(key, plan.clone());
                Ok(plan)
            }
        }
    }

    /// Diagnostic: number of memoized plans.
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memoizes_identical_source_by_reference() {
        let planner = Planner::new();
        let source = "query Q { user { id } }";
        let first = planner.get_plan(source, None).unwrap();
        let second = planner.get_plan(source, None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn distinguishes_by_fragment_name() {
        let planner = Planner::new();
        let source = "fragment A on User { id } fragment B on User { email }";
        let a = planner.get_plan(source, Some("A")).unwrap();
        let b = planner.get_plan(source, Some("B")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn passthrough_plan_is_not_recompiled() {
        let planner = Planner::new();
        let source = "query Q { user { id } }";
        let plan = planner.get_plan(source, None).unwrap();
        let passthrough = planner.get_plan(plan.clone(), None).unwrap();
        assert!(Arc::ptr_eq(&plan, &passthrough));
        assert_eq!(planner.len(), 1);
    }
}
