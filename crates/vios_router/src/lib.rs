//! Session-multiplexing router between one speech engine and many voice apps.
//!
//! The engine speaks a length-prefixed frame protocol over a single byte
//! stream. Each frame carries `>>instance|type|id|args<<`. The [`Router`]
//! ingests those frames and delivers each one to the session that owns it:
//! recognized phrases by vocabulary, dictation to the foregrounded session,
//! and replies by the instance named in the frame. Sessions talk back
//! through a single serialized write path.
//!
//! # Example
//!
//! ```ignore
//! use vios_router::{Router, RouterConfig, Session};
//!
//! let (reader, writer) = stream.into_split();
//! let router = Router::new(writer, RouterConfig::default());
//! let ingest = router.spawn(reader);
//!
//! let shell = Session::new(router.clone(), "shell");
//! shell.start();
//! let choice = shell
//!     .grammar_prompt_and_read(Some(vec!["exit".into()]), "Say exit.")
//!     .await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod grammar;
pub mod message;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;

pub use config::{ByteOrder, RouterConfig};
pub use error::{FieldEncodingError, FrameError, RouteError, RouterError, TransportError};
pub use grammar::GrammarMapper;
pub use message::{InstanceId, Message, MessageId, kind};
pub use registry::SessionRegistry;
pub use router::Router;
pub use session::{Lifecycle, Session};
pub use supervisor::{AppFn, Supervisor, make_app};
