pub mod engine;
pub mod math;
pub mod source;

pub use engine::IndicatorEngine;
pub use math::{Bollinger, Macd};
pub use source::Source;
