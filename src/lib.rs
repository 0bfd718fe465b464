pub mod config;
pub mod executor;
pub mod metrics;
pub mod scenario;
pub mod stages;
pub mod worker;

pub use config::{Config, ConfigError};
pub use executor::RampingExecutor;
pub use metrics::{ExportError, Metrics, RequestOutcome, Summary, Trend};
pub use scenario::{HttpGet, Scenario, ScenarioError};
pub use stages::{RampPlan, Stage};
