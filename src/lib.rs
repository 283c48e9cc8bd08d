pub mod catalog;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod schema_rag;
pub mod warehouse;

pub use config::AppConfig;
pub use error::{BiError, ErrorKind, Result};
pub use orchestrator::{Answer, Orchestrator};
pub use warehouse::WarehouseTarget;
