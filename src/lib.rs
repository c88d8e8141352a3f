pub mod alpha;
pub mod arbiter;
pub mod breakout;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod exchange;
pub mod feed;
pub mod grid;
pub mod ladder;
pub mod logging;
pub mod pid;
pub mod regime;
pub mod reliability;
pub mod sizing;
pub mod state;
pub mod storage;
pub mod timeframe;
