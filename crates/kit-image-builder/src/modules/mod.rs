use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod base;
pub mod boot;
pub mod core;
pub mod output;
pub mod packages;
pub mod provision;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(base::BaseModule),
        Box::new(packages::PackagesModule),
        Box::new(provision::ProvisionModule),
        Box::new(boot::BootModule),
        Box::new(output::OutputModule),
    ]
}

/// Plan every detected module and add the default barriers.
pub fn build_plan(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}
