//! # ReachClaw Leads
//!
//! Turns contact signals into a 0-100 score and a funnel stage
//! (cold / neutral / warm / hot). Each of the five dimensions is a plain
//! function that can be swapped on the scorer.

pub mod scorer;
pub mod tracker;

pub use scorer::{DimensionFn, LeadScore, LeadScorer};
pub use tracker::{LeadChange, LeadTracker, rescore};
