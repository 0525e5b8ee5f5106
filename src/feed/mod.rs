// Rolling one-minute candle windows fed from the broker
pub mod candle_window;
pub mod data_feed;
pub mod validator;

pub use candle_window::{CandleWindow, UpdateOutcome};
pub use data_feed::{DataFeed, FeedStatus};
pub use validator::{CandleValidator, WindowViolation};
