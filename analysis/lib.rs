#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod linalg;
pub mod power;
pub mod satterthwaite;

#[path = "../design/mod.rs"]
pub mod design;

#[path = "../simulate/mod.rs"]
pub mod simulate;
