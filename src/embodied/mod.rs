//! Geometric helpers for robotics costs.

pub mod signed_distance_field;

pub use signed_distance_field::{SignedDistanceField2D, distance_transform};
