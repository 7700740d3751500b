pub mod adapter;
pub mod aggregator;
pub mod boost;
pub mod boundary;
pub mod candidate;
pub mod collector;
pub mod config;
pub mod grading;
pub mod learning;
pub mod logging;
pub mod pipeline;
pub mod reliability;
pub mod storage;
pub mod store;
pub mod tier;
pub mod verify;
pub mod weights;
