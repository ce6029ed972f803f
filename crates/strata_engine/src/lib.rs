mod client;
mod convert;
mod executor;
mod filter;
mod mutation;
mod ops;
mod pipeline;
mod plan;
mod results;
mod validator;

pub use client::{Client, ModelClient};
pub use filter::FilterBuilder;
pub use ops::{MutationAction, Operation};
pub use pipeline::{
    InterceptionDecision, MutationHookEvent, Plugin, PluginContext, QueryCtx, QueryNext,
    StatementNext,
};
pub use plan::{PostPlan, QueryPlan, QueryPlanner, DELEGATE_PREFIX};
pub use results::ResultProcessor;
pub use validator::Validator;

pub use strata_core as core;
