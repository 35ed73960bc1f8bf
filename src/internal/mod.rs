//! Internal implementation details.

pub(crate) mod inflight;

pub(crate) use inflight::{next_id, Claim, ClaimId, InFlight, InstanceCache};
