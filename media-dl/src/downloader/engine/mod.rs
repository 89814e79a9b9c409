//! Byte transports used by the download drivers.

mod http;
mod traits;

pub use http::{HttpTransport, HttpTransportConfig};
pub use traits::{ByteRange, ByteStream, FetchRequest, FetchResponse, Transport};
