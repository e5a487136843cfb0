//! Integration suite: the execution core end to end against an in-memory
//! mock chain.

mod mock_chain;
mod pipeline;
