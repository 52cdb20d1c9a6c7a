pub mod config;
pub mod error;
pub mod proxy;
pub mod shutdown;
pub mod supervisor;

pub use config::{
    Cli, Config, HealthCheckConfig, LogFormat, Placeholder, PlaceholderMode, PortMapping,
    ProxyConfig,
};
pub use error::{ConfigError, HealthDirectiveError, ListenerError, MappingError, SupervisorError};
pub use proxy::{Dispatcher, ListenerStats, MappingListener, SessionOutcome};
pub use shutdown::{ShutdownCoordinator, StopSignal};
pub use supervisor::BackendProcess;
