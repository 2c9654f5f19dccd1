pub mod cancel;
pub mod config;
pub mod convert;
pub mod decode;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod render;
pub mod sink;
pub mod source;
pub mod stage;
pub mod unit;
