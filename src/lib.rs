// src/lib.rs

//! tuspapeles2026 client bot library
//!
//! Polls the appointment portal for each configured target, detects slots
//! that appeared since the last poll and notifies subscribers.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
