//! Stream resolution pipeline.
//!
//! Resolves an anime query into playable direct media URLs: the
//! dispatcher fans the query out to every registered source, each
//! source's candidate resolver walks search → identity confirmation →
//! episode lookup → mirror extraction → redirect resolution, and the
//! orchestrator runs the whole thing asynchronously behind a
//! submit/poll interface.

pub mod dispatcher;
pub mod fetch;
pub mod orchestrator;
pub mod render;
pub mod sources;

pub use dispatcher::Dispatcher;
pub use fetch::{FetchHeaders, FetchedPage, Fetcher, HttpFetcher};
pub use orchestrator::{Orchestrator, PollStatus};
pub use render::{RenderedFetch, RenderedPage, StaticRenderer};
pub use sources::{AnimePahe, ResolveAbort, SourceResolution, StreamSource};
