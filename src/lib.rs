pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod filter;
pub mod ldap_protocol;
pub mod metrics;
pub mod search;
pub mod tls;
pub mod transport;

pub use config::Config;
pub use connection::{Connection, ConnectionOptions, ConnectionState, SearchOptions};
pub use entry::{Attribute, AttributeSet, Entry};
pub use error::{LdapError, Result};
pub use filter::Filter;
pub use ldap_protocol::{DerefAliases, LdapResult, ResultCode, SearchScope};
pub use metrics::{Metrics, MetricsSnapshot};
pub use search::SearchResultStream;
pub use tls::{TlsMode, TlsOptions};
