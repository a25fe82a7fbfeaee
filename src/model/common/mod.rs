pub mod ballot;
pub mod election;
