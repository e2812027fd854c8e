//! The `.tsk` XML format.
//!
//! [`reader`] understands every format revision from 1 to
//! [`CURRENT_VERSION`]; [`writer`] always produces the current one.
//! [`delta`] handles the change ledger sidecar.

pub mod delta;
pub mod reader;
pub mod schema;
pub mod writer;

pub use reader::{ParsedDocument, ReadIssue, XmlReader, read_file};
pub use schema::{CURRENT_VERSION, SchemaLayout};
pub use writer::Contents;
