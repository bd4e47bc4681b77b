pub mod candle;
pub mod subscriber;

pub use candle::Candle;
