// ── Domain model ──
//
// Typed views of the documents exchanged with the server. Every type
// keeps unknown fields so that read-modify-write cycles never lose data.

pub mod admin;
pub mod file;
pub mod object;
pub mod state;
pub mod system;

pub use admin::{Certificate, CertificateKind, IpAddressEntry};
pub use file::{FileAclChange, FileContent, FileData, FileEntry};
pub use object::{IoObject, ObjectIdentity, fix_admin_ui};
pub use state::{HistoryResult, State};
pub use system::{LogEntry, PermissionError, VersionInfo, normalize_language};
