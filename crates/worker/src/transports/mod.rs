pub mod ftp;
pub mod http;
pub mod mail;

pub use ftp::{ClientConnector, FtpTransport, ProtocolConnector, RemoteFileClient};
pub use http::HttpTransport;
pub use mail::{MailTransport, SmtpSettings};
