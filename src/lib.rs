//! Sendgate - Rate Limited Campaign Dispatch
//!
//! This crate implements the sending core of an email-marketing backend: a
//! per-user fixed-window rate limiter, and a campaign dispatcher that sends to
//! each recipient in turn while staying under that limit.

pub mod config;
pub mod dispatch;
pub mod email;
pub mod error;
pub mod ratelimit;
