//!
//! Client for the Source Engine query protocol.
//!
//! The `a2s` crate asks Source game servers for their metadata (A2S_INFO), the connected
//! players (A2S_PLAYER) and server variables (A2S_RULES), over blocking UDP sockets.
//!
//! ```no_run
//! use a2s::SourceQuery;
//!
//! let port: u16 = 27015;
//! let mut query = SourceQuery::new(("127.0.0.1", port));
//! let info = query.server_info();
//! println!("{} on {}", info.name, info.map);
//!
//! if let Ok(rules) = query.rules() {
//!     for rule in rules {
//!         println!("{} = {}", rule.name, rule.value);
//!     }
//! }
//! ```

pub mod dns;
pub mod errors;
pub mod models;
pub use models::*;
pub mod protocols;
pub mod transport;
pub mod util;

pub use errors::{Error, Result};
pub use protocols::a2s::SourceQuery;
