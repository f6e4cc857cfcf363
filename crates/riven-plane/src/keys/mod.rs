//! Key management for the vault's seal key

pub mod seal;

pub use seal::SealKeys;
