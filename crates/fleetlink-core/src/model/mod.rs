// ── Domain model ──

pub mod device;

pub use device::{Device, Generation, GenerationClass, MacAddress};
