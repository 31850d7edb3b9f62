//! Request interception with offline fallbacks.
//!
//! Every same-origin request is classified into a strategy (cache-first,
//! network-first or stale-while-revalidate) and a cache region. Responses
//! served from cache carry `x-offsync-*` annotation headers; requests nobody
//! can answer get a structured 503 instead of a transport error.

mod classify;
mod control;
mod layer;
mod response;

pub use classify::{cache_key, Route, Rules, Strategy, STATIC_EXTENSIONS};
pub use control::{CacheStatus, ControlMessage, ControlReply, Lifecycle, RegionStatus};
pub use layer::{Intercepted, Interceptor, RegionTtls};
pub use response::{
  OfflineBody, OfflineKind, Response, StoredResponse, CACHED_AT_HEADER, OFFLINE_HEADER,
  REVALIDATING_HEADER, SOURCE_HEADER,
};
