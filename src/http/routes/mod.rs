pub mod agents;
pub mod attestation;
pub mod automation;
pub mod escrow;
pub mod health;
pub mod policy;
pub mod sessions;
pub mod trust;
