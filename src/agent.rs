//! Validation agents: pure checks over the message body.
//!
//! Agents never touch persisted state. A failed check is a `no` outcome whose
//! reason lists every violation; only misconfiguration is an `Err`.

pub mod denylist;
pub mod verify_request;
pub mod verify_sql;
pub mod verify_upsert;

pub use denylist::Denylist;
pub use verify_request::{VerifyRequest, is_rule_code, verify_request};
pub use verify_sql::{VerifySql, verify_sql};
pub use verify_upsert::{VerifyUpsert, verify_upsert};

use serde_json::json;

use crate::{
    envelope::{Mutation, keys},
    error::ValidationError,
    step::StepOutcome,
};

/// `no` outcome carrying the violations both as reason text and as data.
pub(crate) fn rejected(err: &ValidationError) -> StepOutcome {
    StepOutcome::no(err.to_string())
        .with_mutation(Mutation::set(keys::VIOLATIONS, json!(err.violations)))
}
