//! Study designs: parameters, dropout, model formulas and variance structures.
pub mod dropout;
pub mod formula;
pub mod params;
pub mod structure;
pub mod study;
