mod generator;
mod record;
mod voc;

pub use generator::*;
pub use record::*;
pub use voc::*;
