//! Aggregator implementations

pub mod candle;
pub mod time_label;

pub use candle::CandleAggregator;
pub use time_label::{
    align_time, align_to_timeframe, bucket_close_epoch, format_time_label, is_bucket_closed,
    is_timeframe_boundary, label_epoch, parse_time_label,
};
