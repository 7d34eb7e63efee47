//! SMS verification rate limiting
//!
//! This crate protects SMS verification flows against abuse. Every request is
//! checked against two escalating-timeout limiters, one keyed by the client's
//! IP address and one by the phone number, whose state lives either in process
//! memory or in a shared Redis server updated with optimistic transactions.

pub mod config;
pub mod error;
pub mod ratelimit;
