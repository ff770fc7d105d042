//! Classification pipeline.
//!
//! Inbound messages flow through:
//! 1. `Ingestor::ingest()`: full message into the `CorrelationStore`, task into the `TaskBuffer`
//! 2. `BatchScheduler::run_tick()`: drains the buffer on a fixed interval
//! 3. `FilterProcessor::classify()`: chunked filter evaluation and optional summary
//! 4. Assembly: results rejoin their original message, matched ones go to the `ResultSink`
//!
//! The synchronous `/process` endpoint calls the processor directly and
//! never touches the store or the buffer.

pub mod processor;
pub mod prompts;
pub mod scheduler;
pub mod store;
pub mod types;
