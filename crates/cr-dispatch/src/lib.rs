//! Dispatch engine: cycle controller, send policy, template rendering and
//! the gateway / directory clients.

pub mod controller;
pub mod directory;
pub mod gateway;
pub mod policy;
pub mod template;

pub use controller::{
    ControllerConfig, CycleOutcome, CycleReport, DispatchController, DispatchStats,
};
pub use directory::{DirectoryOutcome, DirectoryService, HttpDirectory, HttpDirectoryConfig};
pub use gateway::{HttpGateway, HttpGatewayConfig, MessageGateway, SendError};
pub use template::{TemplateCatalog, DEFAULT_BODY, DEFAULT_TEMPLATE_ID};
