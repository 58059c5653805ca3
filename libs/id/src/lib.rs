//! # cadence-id
//!
//! Typed identifiers for the cadence scheduler.
//!
//! Every identifier is a ULID with a resource prefix, rendered as
//! `{prefix}_{ulid}`:
//!
//! - `org_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `job_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `node_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a job id from being passed where an organization id is
//! expected, and the textual form is what the shard ring hashes, so it must
//! stay stable across releases.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

/// Split `{prefix}_{ulid}` and validate the prefix.
///
/// Shared by every type generated with [`define_id!`].
pub fn parse_prefixed(s: &str, prefix: &'static str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let (actual, raw) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
    if actual != prefix {
        return Err(IdError::InvalidPrefix {
            expected: prefix,
            actual: actual.to_string(),
        });
    }

    raw.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
