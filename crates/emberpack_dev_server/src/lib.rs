pub mod chunk;
pub mod compile;
pub mod hmr;
pub mod logging;
pub mod options;
pub mod protocol;
pub mod server;
pub mod test_utils;
pub mod tracer;
pub mod watch;

pub use chunk::Chunk;
pub use chunk::ChunkAssembler;
pub use compile::CompileOutput;
pub use compile::Compiler;
pub use compile::Resolver;
pub use hmr::BuildDelivery;
pub use hmr::HmrCoordinator;
pub use options::DevServerOptions;
pub use protocol::ClientMessage;
pub use protocol::ServerMessage;
pub use protocol::SyncEvent;
pub use server::BuildState;
pub use server::DevServer;
pub use server::ServerHandle;
pub use tracer::ChangeTracer;
pub use tracer::TraceOutcome;
pub use watch::WatchBatch;
pub use watch::WatchEvent;
pub use watch::WatchEventKind;
