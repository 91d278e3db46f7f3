//! The vault: the only code in the workspace allowed to touch the
//! user-owned notes directory. Four pieces, matching spec §4.2-§4.4 and
//! §6's Markdown contract: path resolution, atomic writes, collision
//! detection, and note formatting.

mod atomic_writer;
mod collision;
mod markdown;
mod path_resolver;

pub use atomic_writer::write_atomic;
pub use collision::{detect_collision, CollisionDecision};
pub use markdown::{format_note, format_placeholder_note};
pub use path_resolver::{ensure_vault_dirs, resolve_capture_path};
