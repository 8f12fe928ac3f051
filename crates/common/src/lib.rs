// murmur-common: shared chat types and the realtime wire protocol

pub mod protocol;
pub mod types;
