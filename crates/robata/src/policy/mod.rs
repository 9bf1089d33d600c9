//! # Generation Policies
//!
//! Per-request decision objects applied by the step executor to every row:
//!
//! * [`TokenPolicy`] picks the next token from a row's final-position logits
//! * [`StopPolicy`] decides whether the row is done and why
//!
//! Both are closed sets of strategies configured from request parameters.
//! Construction validates the parameters, so a request that would fail inside
//! a shared step is rejected at admission instead.

mod stop;
mod token;

pub use stop::{FinishReason, StopPolicy};
pub use token::{Choice, NextToken, TokenPolicy};
