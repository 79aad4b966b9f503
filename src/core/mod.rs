pub mod control;
pub mod gateway;
pub mod ledger;
pub mod llm;
pub mod orchestrator;
pub mod store;
pub mod terminal;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
