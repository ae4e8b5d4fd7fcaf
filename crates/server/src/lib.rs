pub mod config;
pub mod handler;
pub mod net;
pub mod routes;
pub mod supervisor;

pub use config::{ServerConfig, SupervisorConfig};
pub use handler::{ErrorResponse, HandlerError, InferenceResponse, PredictRequest, RequestHandler};
pub use routes::{AppState, router};
pub use supervisor::{PoolError, WorkerPool};
