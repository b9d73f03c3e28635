pub mod codec;
pub mod config;
pub mod egress;
pub mod framer;
pub mod ingress;
pub mod link;
pub mod session;
pub mod shutdown;


// Re-export the wire-level types for direct access
pub use codec::{CodecError, Command, Endpoint, Frame, HEADER_LEN, MAX_DATA_LEN};
pub use framer::Framer;

// Re-export the runtime surface used by the binaries
pub use config::{ConfigError, MappingTable, PortMapping};
pub use link::{Link, LinkError, LinkStats, LinkWriter};
pub use session::{
    SessionEntry, SessionError, SessionId, SessionProgress, SessionState, SessionTable,
};
pub use shutdown::ShutdownReason;

/// Error returned by most functions.
///
/// Hot paths (the codec, the framer, the link) define their own `enum`
/// errors because those are hit and handled during normal execution; the
/// boxed form is for setup code where the extra allocation does not matter.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Picks the log level from the `VERBOSE`, `DEBUG` and `QUIET` environment
/// variables, most verbose wins. These only affect logging, never wire
/// behaviour.
pub fn log_level_from_env() -> tracing::Level {
    if std::env::var_os("VERBOSE").is_some() {
        tracing::Level::TRACE
    } else if std::env::var_os("DEBUG").is_some() {
        tracing::Level::DEBUG
    } else if std::env::var_os("QUIET").is_some() {
        tracing::Level::ERROR
    } else {
        tracing::Level::INFO
    }
}
