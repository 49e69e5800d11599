//! Gatehouse - permission resolution and storage service
//!
//! Gatehouse pulls resource inventories and user/group memberships from
//! external systems-of-record, computes each user's effective permission
//! set, and persists the results behind pluggable repository backends for
//! fast per-user reads by edge services.

pub mod errors;
pub mod model;
pub mod permissions;
pub mod providers;
pub mod repository;
pub mod roles;
pub mod settings;
pub mod sync;
pub mod web;
