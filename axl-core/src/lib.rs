#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod checksum;
mod credentials;
mod endpoint;
mod error;
mod member;

pub use checksum::crc32;
pub use credentials::{Credentials, CredentialsProvider, StaticCredentialsProvider};
pub use endpoint::{DEFAULT_PORT, Endpoint, parse_endpoints};
pub use error::{AxlError, Result};
pub use member::{ClusterDescription, ClusterMember, NodeRole};

pub const AXL_MAGIC: [u8; 4] = [0x41, 0x58, 0x4C, 0x4E]; // 'AXLN'
