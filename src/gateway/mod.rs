//! HTTP surface of the gateway: the security middleware, the request pipeline
//! it drives, the management handlers and the upstream proxy.

pub mod handlers;
pub mod pipeline;
pub mod proxy;
pub mod response;
pub mod security_layer;
pub mod server;

pub use pipeline::{PipelineDeps, PipelineOutcome, SecurityPipeline};
pub use proxy::{UpstreamProxy, UpstreamTarget};
pub use security_layer::RequestContext;
pub use server::{build_router, AppState, Gateway, GatewayBuilder};
