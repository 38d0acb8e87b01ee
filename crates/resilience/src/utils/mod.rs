//! Serialization helpers shared by the configuration types

pub mod serde;

pub use self::serde::duration_millis;
