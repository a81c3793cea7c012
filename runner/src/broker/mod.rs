pub mod paper;

pub use paper::{BrokerError, PaperBroker};
