//! Geometry utilities: SE3 poses and Sim3 map corrections.

pub mod se3;
pub mod sim3;

pub use se3::SE3;
pub use sim3::Sim3;
