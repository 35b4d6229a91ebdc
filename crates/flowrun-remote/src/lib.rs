pub mod bridge;
pub mod http;
pub mod tool;

pub use bridge::{RemoteDiagramRenderer, RemoteModelProvider, RemoteSandbox};
pub use http::ReqwestHttpClient;
pub use tool::HttpTool;
