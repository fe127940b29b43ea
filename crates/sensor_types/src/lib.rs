//! Shared types for wearable sensor drivers
//!
//! Every device family (Shimmer today, others later) emits the same
//! `SensorEvent`s carrying self-describing `SampleFrame`s, and implements the
//! `Sensor` trait so an application can drive heterogeneous devices through
//! one interface.

pub mod data;
pub mod event;
pub mod sensor;

// Re-export commonly used types
pub use data::*;
pub use event::*;
pub use sensor::*;
