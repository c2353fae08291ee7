pub mod anthropic;
pub mod anthropic_stream;
pub mod assemble;
pub mod events;
pub mod notes;
pub mod provider;
pub mod retrieval;
pub mod tools;
pub mod turn;
