//! Burstgate - Tiered Token Bucket Rate Limiting
//!
//! This crate implements an in-process rate limiter keyed by target identity
//! (an IP address, an account id). Each request may be checked against several
//! tiers at once, every tier being a token bucket with its own refill rate and
//! burst capacity. New buckets start with a configurable warm-up "precharge"
//! and idle ones are dropped from a self-managing cache.

pub mod config;
pub mod error;
pub mod ratelimit;
