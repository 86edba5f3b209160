pub mod charset;
pub mod decode;
pub mod emit;
pub mod engine;
pub mod rewrite;
pub mod target;
pub mod upstream;

use url::Url;

use crate::gate::VisitorIdentity;

pub use engine::BrowsingProxy;

/// Privacy flags chosen by the visitor for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    pub hide_referer: bool,
    pub remove_cookies: bool,
}

/// Everything the pipeline knows about one inbound proxy request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub target: Url,
    pub options: ProxyOptions,
    pub identity: VisitorIdentity,
}
