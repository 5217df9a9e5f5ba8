// crates/tonecut-media/src/helpers/mod.rs

pub mod seek;
